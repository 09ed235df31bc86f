use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use entity_metrics::{
    Aggregation, Metric, MetricKind, MetricsConfig, MetricsRecorder, MetricsStatistics, Period,
    Subject,
};

mod logging;

use logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "entity-metrics")]
#[command(about = "Record counters and timers on entities and query period statistics")]
#[command(version)]
struct Cli {
    /// TOML config file (user_kind, database_path)
    #[arg(long, env = "METRICS_CONFIG", default_value = "metrics.toml")]
    config: PathBuf,

    /// Overrides the configured database path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the metrics table if it does not exist
    Init,
    /// Start a metric, or add to an open counter
    Add(FireArgs),
    /// Close an open metric
    Close(FireArgs),
    /// Fire a one-shot metric (counters only)
    Once(FireArgs),
    /// Aggregate closed metrics per period
    Stats {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long, default_value = "week")]
        period: Period,

        /// count, avg, sum, min or max
        #[arg(long, default_value = "count")]
        aggregate: Aggregation,
    },
    /// List closed metrics matching the filters
    Show {
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Counter,
    Timer,
}

impl From<KindArg> for MetricKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Counter => MetricKind::Counter,
            KindArg::Timer => MetricKind::Timer,
        }
    }
}

#[derive(Args, Debug)]
struct FireArgs {
    /// Metric type, e.g. page_views
    #[arg(long)]
    metric: String,

    #[arg(long, value_enum, default_value = "counter")]
    kind: KindArg,

    /// Amount added per counter event
    #[arg(long, default_value_t = 1)]
    increment: i64,

    /// Kind of the measured entity, e.g. Order
    #[arg(long)]
    subject_kind: String,

    #[arg(long)]
    subject_id: String,

    /// Id of the user the metric belongs to
    #[arg(long)]
    user: Option<String>,

    /// Id of the user who fired the metric
    #[arg(long)]
    admin: Option<String>,
}

#[derive(Args, Debug)]
struct FilterArgs {
    #[arg(long)]
    metric: String,

    #[arg(long, value_enum, default_value = "counter")]
    kind: KindArg,

    /// Lower bound on end_at (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_time)]
    from: Option<DateTime<Utc>>,

    /// Upper bound on end_at (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_time)]
    to: Option<DateTime<Utc>>,

    /// User ids (repeatable)
    #[arg(long)]
    user: Vec<String>,

    /// Admin ids (repeatable)
    #[arg(long)]
    admin: Vec<String>,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .map_err(|error| format!("invalid timestamp {value:?}: {error}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = MetricsConfig::load(Some(cli.config.as_path()))
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    log::debug!("using database {}", config.database_path.display());

    let recorder = MetricsRecorder::open(config).await?;

    match cli.command {
        Commands::Init => {
            log::info!(
                "metrics table ready in {}",
                recorder.config().database_path.display()
            );
        }
        Commands::Add(args) => {
            let (metric, subject) = build_metric(&recorder, &args)?;
            report("add", metric.add(&subject).await?);
        }
        Commands::Close(args) => {
            let (metric, subject) = build_metric(&recorder, &args)?;
            report("close", metric.close(&subject).await?);
        }
        Commands::Once(args) => {
            let (metric, subject) = build_metric(&recorder, &args)?;
            report("once", metric.once(&subject).await?);
        }
        Commands::Stats {
            filter,
            period,
            aggregate,
        } => {
            let stats = build_statistics(&recorder, &filter)?.period(period);
            let rows = stats.aggregate(aggregate).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Show { filter } => {
            let records = build_statistics(&recorder, &filter)?.records().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn build_metric(recorder: &MetricsRecorder, args: &FireArgs) -> anyhow::Result<(Metric, Subject)> {
    let user_kind = recorder.config().user_kind.clone();
    let mut metric = match MetricKind::from(args.kind) {
        MetricKind::Counter => recorder.counter_by(&args.metric, args.increment),
        MetricKind::Timer => recorder.timer(&args.metric),
    };
    if let Some(user) = &args.user {
        metric = metric.with_user(Subject::new(&user_kind, user))?;
    }
    if let Some(admin) = &args.admin {
        metric = metric.with_admin(Subject::new(&user_kind, admin))?;
    }

    Ok((metric, Subject::new(&args.subject_kind, &args.subject_id)))
}

fn build_statistics(
    recorder: &MetricsRecorder,
    filter: &FilterArgs,
) -> anyhow::Result<MetricsStatistics> {
    let user_kind = recorder.config().user_kind.clone();
    let to_subjects = |ids: &[String]| -> Vec<Subject> {
        ids.iter().map(|id| Subject::new(&user_kind, id)).collect()
    };

    let mut stats = recorder
        .metric(&filter.metric, filter.kind.into())
        .statistics();
    stats = match (filter.from, filter.to) {
        (Some(from), Some(to)) => stats.between(Some(from), Some(to)),
        (Some(from), None) => stats.start_at(Some(from)),
        (None, Some(to)) => stats.end_at(Some(to)),
        (None, None) => stats,
    };

    Ok(stats
        .user(to_subjects(&filter.user))?
        .admin(to_subjects(&filter.admin))?)
}

fn report(operation: &str, succeeded: bool) {
    if succeeded {
        log::info!("{} succeeded", operation);
    } else {
        log::warn!("{} was refused (see log for the reason)", operation);
    }
}
