use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{MetricsError, MetricsResult};
use crate::query::MetricsQuery;
use crate::record::{MetricData, MetricKind, MetricRecord};
use crate::statistics::{Aggregation, StatisticValue, StatisticsRow};
use crate::subject::Subject;

const RECORD_COLUMNS: &str = "id, type, kind, count, data, is_failed, metricable_id, metricable_type, user_id, admin_id, start_at, end_at";

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn init(&self) -> MetricsResult<()>;

    /// The open record for `metricable` + `metric_type` + `kind`, narrowed
    /// to `user_id` when given.
    ///
    /// At most one should exist. If several do, the earliest started one is
    /// returned.
    async fn find_open(
        &self,
        metricable: &Subject,
        metric_type: &str,
        kind: MetricKind,
        user_id: Option<&str>,
    ) -> MetricsResult<Option<MetricRecord>>;

    async fn find(&self, id: &str) -> MetricsResult<Option<MetricRecord>>;

    /// Inserts the record or overwrites the row with the same id.
    async fn save(&self, record: &MetricRecord) -> MetricsResult<()>;

    async fn records(&self, query: &MetricsQuery) -> MetricsResult<Vec<MetricRecord>>;

    async fn statistics(
        &self,
        query: &MetricsQuery,
        aggregation: Aggregation,
    ) -> MetricsResult<Vec<StatisticsRow>>;
}

#[derive(Debug, Clone)]
pub struct SqliteMetricsStore {
    db_path: PathBuf,
}

impl SqliteMetricsStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, func: F) -> MetricsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> MetricsResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_connection(&db_path)?;
            func(&connection)
        })
        .await
        .map_err(|error| MetricsError::Task(error.to_string()))?
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn init(&self) -> MetricsResult<()> {
        self.with_connection(|connection| {
            connection.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS metrics (
                    id TEXT PRIMARY KEY,
                    type TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    count INTEGER NOT NULL DEFAULT 0,
                    data TEXT NOT NULL DEFAULT '{}',
                    is_failed INTEGER NOT NULL DEFAULT 0,
                    metricable_id TEXT NOT NULL,
                    metricable_type TEXT NOT NULL,
                    user_id TEXT,
                    admin_id TEXT,
                    start_at TEXT NOT NULL,
                    end_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_metrics_open
                    ON metrics(metricable_type, metricable_id, type, kind, end_at);
                CREATE INDEX IF NOT EXISTS idx_metrics_type_end_at ON metrics(type, end_at);
                CREATE INDEX IF NOT EXISTS idx_metrics_user ON metrics(user_id);
                CREATE INDEX IF NOT EXISTS idx_metrics_admin ON metrics(admin_id);
                "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn find_open(
        &self,
        metricable: &Subject,
        metric_type: &str,
        kind: MetricKind,
        user_id: Option<&str>,
    ) -> MetricsResult<Option<MetricRecord>> {
        let mut params_vec = vec![
            metricable.id.clone(),
            metricable.kind.clone(),
            metric_type.to_string(),
            kind.as_str().to_string(),
        ];
        let mut sql = format!(
            "SELECT {} FROM metrics WHERE metricable_id = ? AND metricable_type = ? AND type = ? AND kind = ? AND end_at IS NULL",
            RECORD_COLUMNS
        );
        if let Some(user_id) = user_id {
            sql.push_str(" AND user_id = ?");
            params_vec.push(user_id.to_string());
        }
        sql.push_str(" ORDER BY start_at ASC, id ASC LIMIT 1");

        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params_vec.iter()))?;
            match rows.next()? {
                Some(row) => Ok(Some(read_record(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn find(&self, id: &str) -> MetricsResult<Option<MetricRecord>> {
        let id = id.to_string();
        self.with_connection(move |connection| {
            let sql = format!("SELECT {} FROM metrics WHERE id = ?1", RECORD_COLUMNS);
            let raw = connection
                .query_row(&sql, params![id], RawRecord::from_row)
                .optional()?;
            raw.map(RawRecord::into_record).transpose()
        })
        .await
    }

    async fn save(&self, record: &MetricRecord) -> MetricsResult<()> {
        let data = serde_json::to_string(&record.data)?;
        let record = record.clone();

        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO metrics (
                    id, type, kind, count, data, is_failed,
                    metricable_id, metricable_type, user_id, admin_id, start_at, end_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(id) DO UPDATE SET
                    type = excluded.type,
                    kind = excluded.kind,
                    count = excluded.count,
                    data = excluded.data,
                    is_failed = excluded.is_failed,
                    metricable_id = excluded.metricable_id,
                    metricable_type = excluded.metricable_type,
                    user_id = excluded.user_id,
                    admin_id = excluded.admin_id,
                    start_at = excluded.start_at,
                    end_at = excluded.end_at
                "#,
                params![
                    record.id,
                    record.metric_type,
                    record.kind.as_str(),
                    record.count,
                    data,
                    record.is_failed,
                    record.metricable.id,
                    record.metricable.kind,
                    record.user_id,
                    record.admin_id,
                    format_timestamp(record.start_at),
                    record.end_at.map(format_timestamp),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn records(&self, query: &MetricsQuery) -> MetricsResult<Vec<MetricRecord>> {
        let (where_clause, params_vec) = query.where_clause();

        self.with_connection(move |connection| {
            let sql = format!(
                "SELECT {} FROM metrics WHERE {} ORDER BY end_at DESC, id ASC",
                RECORD_COLUMNS, where_clause
            );
            let mut stmt = connection.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params_vec.iter()))?;
            let mut records = Vec::new();

            while let Some(row) = rows.next()? {
                records.push(read_record(row)?);
            }

            Ok(records)
        })
        .await
    }

    async fn statistics(
        &self,
        query: &MetricsQuery,
        aggregation: Aggregation,
    ) -> MetricsResult<Vec<StatisticsRow>> {
        let (where_clause, params_vec) = query.where_clause();
        let period = query.period();
        let bucket = period.bucket_sql();

        self.with_connection(move |connection| {
            let sql = format!(
                r#"
                SELECT
                    {aggregate} AS value,
                    strftime('%Y-%m-%d', MAX(end_at)) AS date,
                    {bucket} AS bucket
                FROM metrics
                WHERE {where_clause}
                GROUP BY {bucket}
                ORDER BY MAX(end_at) DESC
                "#,
                aggregate = aggregation.sql(),
                bucket = bucket,
                where_clause = where_clause,
            );

            let mut stmt = connection.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params_vec.iter()))?;
            let mut result = Vec::new();

            while let Some(row) = rows.next()? {
                let raw_date: Option<String> = row.get(1)?;
                let raw_date = raw_date.ok_or_else(|| {
                    MetricsError::InvalidData("statistics bucket without end_at".to_string())
                })?;
                let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")?;
                let value = match aggregation {
                    Aggregation::Avg => {
                        StatisticValue::Float(row.get::<_, Option<f64>>(0)?.unwrap_or_default())
                    }
                    _ => StatisticValue::Integer(row.get::<_, Option<i64>>(0)?.unwrap_or_default()),
                };
                result.push(StatisticsRow {
                    period,
                    bucket: row.get(2)?,
                    date,
                    aggregation,
                    value,
                });
            }

            Ok(result)
        })
        .await
    }
}

fn open_connection(path: &Path) -> MetricsResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let connection = Connection::open(path)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    register_functions(&connection)?;
    Ok(connection)
}

/// `iso_week(ts)`: ISO 8601 week number (weeks start on Monday).
fn register_functions(connection: &Connection) -> MetricsResult<()> {
    connection.create_scalar_function(
        "iso_week",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let raw: Option<String> = ctx.get(0)?;
            raw.map(|raw| {
                parse_timestamp(&raw)
                    .map(|timestamp| i64::from(timestamp.iso_week().week()))
                    .map_err(|error| rusqlite::Error::UserFunctionError(Box::new(error)))
            })
            .transpose()
        },
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 with nanoseconds, so text order is time order and
/// nothing is lost on a save/load cycle.
pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> MetricsResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn parse_optional_timestamp(raw: Option<String>) -> MetricsResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

/// Column values as stored, before JSON and timestamp decoding.
struct RawRecord {
    id: String,
    metric_type: String,
    kind: String,
    count: i64,
    data: String,
    is_failed: bool,
    metricable_id: String,
    metricable_type: String,
    user_id: Option<String>,
    admin_id: Option<String>,
    start_at: String,
    end_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            metric_type: row.get(1)?,
            kind: row.get(2)?,
            count: row.get(3)?,
            data: row.get(4)?,
            is_failed: row.get(5)?,
            metricable_id: row.get(6)?,
            metricable_type: row.get(7)?,
            user_id: row.get(8)?,
            admin_id: row.get(9)?,
            start_at: row.get(10)?,
            end_at: row.get(11)?,
        })
    }

    fn into_record(self) -> MetricsResult<MetricRecord> {
        let kind = MetricKind::from_db(&self.kind)
            .ok_or_else(|| MetricsError::InvalidKind(self.kind.clone()))?;
        let data: MetricData = serde_json::from_str(&self.data)?;

        Ok(MetricRecord {
            id: self.id,
            metric_type: self.metric_type,
            kind,
            count: self.count,
            data,
            is_failed: self.is_failed,
            metricable: Subject::new(self.metricable_type, self.metricable_id),
            user_id: self.user_id,
            admin_id: self.admin_id,
            start_at: parse_timestamp(&self.start_at)?,
            end_at: parse_optional_timestamp(self.end_at)?,
        })
    }
}

fn read_record(row: &Row<'_>) -> MetricsResult<MetricRecord> {
    RawRecord::from_row(row)?.into_record()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    use super::{format_timestamp, MetricsStore, SqliteMetricsStore};
    use crate::record::{MetricKind, MetricRecord, UserRole};
    use crate::subject::Subject;

    #[test]
    fn timestamps_are_fixed_width_utc() {
        let timestamp = Utc
            .with_ymd_and_hms(2026, 2, 10, 9, 5, 0)
            .single()
            .expect("valid datetime");

        assert_eq!(format_timestamp(timestamp), "2026-02-10T09:05:00.000000000Z");
        assert_eq!(
            format_timestamp(timestamp + Duration::milliseconds(750)),
            "2026-02-10T09:05:00.750000000Z"
        );
    }

    #[tokio::test]
    async fn storage_keeps_subsecond_timestamps() {
        let dir = tempdir().expect("temp dir");
        let storage = SqliteMetricsStore::new(dir.path().join("metrics.db"));
        storage.init().await.expect("init storage");

        let start = Utc
            .with_ymd_and_hms(2026, 2, 10, 10, 0, 0)
            .single()
            .expect("valid datetime")
            + Duration::milliseconds(750);
        let mut record =
            MetricRecord::start("checkout", MetricKind::Timer, Subject::new("Order", "7"), start);
        record.end_at = Some(start + Duration::microseconds(1_250_001));

        storage.save(&record).await.expect("save record");
        let loaded = storage
            .find(&record.id)
            .await
            .expect("find record")
            .expect("record exists");

        assert_eq!(loaded.start_at, start);
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn storage_round_trips_a_saved_record() {
        let dir = tempdir().expect("temp dir");
        let storage = SqliteMetricsStore::new(dir.path().join("metrics.db"));
        storage.init().await.expect("init storage");

        let start = Utc
            .with_ymd_and_hms(2026, 2, 10, 10, 0, 0)
            .single()
            .expect("valid datetime");
        let mut record =
            MetricRecord::start("checkout", MetricKind::Timer, Subject::new("Order", "7"), start);
        record.append_fired(start);
        record.record_user_activity(UserRole::User, Some(&Subject::new("User", "1")), start);
        record.end_at = Some(start + Duration::seconds(5));
        record.count = 5;
        record.append_fired(start + Duration::seconds(5));

        storage.save(&record).await.expect("save record");
        let loaded = storage
            .find(&record.id)
            .await
            .expect("find record")
            .expect("record exists");

        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn find_open_ignores_closed_records_and_other_users() {
        let dir = tempdir().expect("temp dir");
        let storage = SqliteMetricsStore::new(dir.path().join("metrics.db"));
        storage.init().await.expect("init storage");

        let start = Utc
            .with_ymd_and_hms(2026, 2, 10, 10, 0, 0)
            .single()
            .expect("valid datetime");
        let order = Subject::new("Order", "7");

        let mut closed = MetricRecord::start("views", MetricKind::Counter, order.clone(), start);
        closed.end_at = Some(start);
        storage.save(&closed).await.expect("save closed");

        let mut open = MetricRecord::start("views", MetricKind::Counter, order.clone(), start);
        open.user_id = Some("1".to_string());
        storage.save(&open).await.expect("save open");

        let found = storage
            .find_open(&order, "views", MetricKind::Counter, Some("1"))
            .await
            .expect("find open");
        assert_eq!(found.map(|record| record.id), Some(open.id.clone()));

        let other_user = storage
            .find_open(&order, "views", MetricKind::Counter, Some("2"))
            .await
            .expect("find open");
        assert!(other_user.is_none());

        let other_type = storage
            .find_open(&order, "clicks", MetricKind::Counter, None)
            .await
            .expect("find open");
        assert!(other_type.is_none());

        let other_kind = storage
            .find_open(&order, "views", MetricKind::Timer, Some("1"))
            .await
            .expect("find open");
        assert!(other_kind.is_none());
    }

    #[tokio::test]
    async fn find_open_prefers_earliest_start_when_duplicated() {
        let dir = tempdir().expect("temp dir");
        let storage = SqliteMetricsStore::new(dir.path().join("metrics.db"));
        storage.init().await.expect("init storage");

        let start = Utc
            .with_ymd_and_hms(2026, 2, 10, 10, 0, 0)
            .single()
            .expect("valid datetime");
        let order = Subject::new("Order", "7");

        let later = MetricRecord::start(
            "views",
            MetricKind::Counter,
            order.clone(),
            start + Duration::minutes(1),
        );
        let earlier = MetricRecord::start("views", MetricKind::Counter, order.clone(), start);
        storage.save(&later).await.expect("save later");
        storage.save(&earlier).await.expect("save earlier");

        let found = storage
            .find_open(&order, "views", MetricKind::Counter, None)
            .await
            .expect("find open")
            .expect("open record");
        assert_eq!(found.id, earlier.id);
    }
}
