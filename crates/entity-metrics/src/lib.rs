pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metric;
pub mod query;
pub mod record;
pub mod statistics;
pub mod storage;
pub mod subject;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::MetricsConfig;
pub use error::{MetricsError, MetricsResult};
pub use lifecycle::{CounterLifecycle, Lifecycle, MetricContext, TimerLifecycle};
pub use metric::{Metric, MetricsRecorder};
pub use query::{MetricsQuery, Period, SubjectSet};
pub use record::{MetricData, MetricKind, MetricRecord, UserRole};
pub use statistics::{Aggregation, MetricsStatistics, StatisticValue, StatisticsRow};
pub use storage::{MetricsStore, SqliteMetricsStore};
pub use subject::{Metricable, Subject};
