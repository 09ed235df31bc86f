use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::MetricsConfig;
use crate::error::MetricsResult;
use crate::lifecycle::{CounterLifecycle, Lifecycle, MetricContext, TimerLifecycle};
use crate::query::MetricsQuery;
use crate::record::MetricKind;
use crate::statistics::MetricsStatistics;
use crate::storage::{MetricsStore, SqliteMetricsStore};
use crate::subject::Subject;

/// Entry point: hands out metrics bound to one store, clock and config.
#[derive(Clone)]
pub struct MetricsRecorder {
    store: Arc<dyn MetricsStore>,
    clock: Arc<dyn Clock>,
    config: Arc<MetricsConfig>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn MetricsStore>, config: MetricsConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        }
    }

    /// Opens (and creates if needed) the SQLite database at
    /// `config.database_path`.
    pub async fn open(config: MetricsConfig) -> MetricsResult<Self> {
        let store = SqliteMetricsStore::new(&config.database_path);
        store.init().await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn MetricsStore> {
        Arc::clone(&self.store)
    }

    pub fn counter(&self, metric_type: impl Into<String>) -> Metric {
        self.with_lifecycle(metric_type, Arc::new(CounterLifecycle::default()))
    }

    /// A counter that adds `increment` per event (an amount of money, bytes, ...).
    pub fn counter_by(&self, metric_type: impl Into<String>, increment: i64) -> Metric {
        self.with_lifecycle(metric_type, Arc::new(CounterLifecycle::new(increment)))
    }

    pub fn timer(&self, metric_type: impl Into<String>) -> Metric {
        self.with_lifecycle(metric_type, Arc::new(TimerLifecycle))
    }

    pub fn metric(&self, metric_type: impl Into<String>, kind: MetricKind) -> Metric {
        match kind {
            MetricKind::Counter => self.counter(metric_type),
            MetricKind::Timer => self.timer(metric_type),
        }
    }

    pub fn with_lifecycle(
        &self,
        metric_type: impl Into<String>,
        lifecycle: Arc<dyn Lifecycle>,
    ) -> Metric {
        Metric {
            recorder: self.clone(),
            metric_type: metric_type.into(),
            lifecycle,
            user: None,
            admin: None,
        }
    }
}

/// One named metric, optionally scoped to the user it belongs to and the
/// admin who fired it.
#[derive(Clone)]
pub struct Metric {
    recorder: MetricsRecorder,
    metric_type: String,
    lifecycle: Arc<dyn Lifecycle>,
    user: Option<Subject>,
    admin: Option<Subject>,
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("metric_type", &self.metric_type)
            .field("lifecycle", &self.lifecycle)
            .field("user", &self.user)
            .field("admin", &self.admin)
            .finish()
    }
}

impl Metric {
    /// Fails with `InvalidSubjectKind` unless `user` has the configured user kind.
    pub fn with_user(mut self, user: Subject) -> MetricsResult<Self> {
        self.recorder.config.check_user_kind(Some(&user))?;
        self.user = Some(user);
        Ok(self)
    }

    pub fn with_admin(mut self, admin: Subject) -> MetricsResult<Self> {
        self.recorder.config.check_user_kind(Some(&admin))?;
        self.admin = Some(admin);
        Ok(self)
    }

    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }

    pub fn kind(&self) -> MetricKind {
        self.lifecycle.kind()
    }

    pub fn user(&self) -> Option<&Subject> {
        self.user.as_ref()
    }

    pub fn admin(&self) -> Option<&Subject> {
        self.admin.as_ref()
    }

    pub async fn add(&self, subject: &Subject) -> MetricsResult<bool> {
        self.lifecycle.add(&self.context(), subject).await
    }

    pub async fn close(&self, subject: &Subject) -> MetricsResult<bool> {
        self.lifecycle.close(&self.context(), subject).await
    }

    pub async fn once(&self, subject: &Subject) -> MetricsResult<bool> {
        self.lifecycle.once(&self.context(), subject).await
    }

    /// A fresh statistics query over this metric's closed records of its kind.
    pub fn query(&self) -> MetricsQuery {
        MetricsQuery::new(
            self.metric_type.clone(),
            &self.recorder.config,
            self.recorder.clock.now(),
        )
        .kind(self.kind())
    }

    pub fn statistics(&self) -> MetricsStatistics {
        MetricsStatistics::new(self.recorder.store(), self.query())
    }

    fn context(&self) -> MetricContext<'_> {
        MetricContext {
            store: self.recorder.store.as_ref(),
            clock: self.recorder.clock.as_ref(),
            metric_type: &self.metric_type,
            kind: self.lifecycle.kind(),
            user: self.user.as_ref(),
            admin: self.admin.as_ref(),
        }
    }
}
