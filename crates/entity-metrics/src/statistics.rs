use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, MetricsResult};
use crate::query::{MetricsQuery, Period, SubjectSet};
use crate::record::MetricRecord;
use crate::storage::MetricsStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Number of records in the bucket.
    Count,
    Avg,
    Sum,
    Min,
    Max,
}

impl Aggregation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    // avg/sum/min/max read the metric value column, not the row count.
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Count => "COUNT(*)",
            Self::Avg => "AVG(count)",
            Self::Sum => "SUM(count)",
            Self::Min => "MIN(count)",
            Self::Max => "MAX(count)",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "avg" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            _ => Err(MetricsError::UnknownAggregation(value.to_string())),
        }
    }
}

/// An aggregate result. `avg` is fractional; the others stay exact integers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StatisticValue {
    Integer(i64),
    Float(f64),
}

impl StatisticValue {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Integer(value) => value as f64,
            Self::Float(value) => value,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(value),
            Self::Float(_) => None,
        }
    }
}

/// One period bucket of an aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsRow {
    pub period: Period,
    /// ISO week, month number, hour of day, ... depending on `period`.
    pub bucket: i64,
    /// Day of the most recently closed record in the bucket.
    pub date: NaiveDate,
    pub aggregation: Aggregation,
    pub value: StatisticValue,
}

/// A metric query plus the store to run aggregates against.
#[derive(Clone)]
pub struct MetricsStatistics {
    store: Arc<dyn MetricsStore>,
    query: MetricsQuery,
}

impl MetricsStatistics {
    pub fn new(store: Arc<dyn MetricsStore>, query: MetricsQuery) -> Self {
        Self { store, query }
    }

    pub fn query(&self) -> &MetricsQuery {
        &self.query
    }

    pub fn into_query(self) -> MetricsQuery {
        self.query
    }

    pub fn start_at(self, start_at: Option<DateTime<Utc>>) -> Self {
        self.map(|query| query.start_at(start_at))
    }

    pub fn end_at(self, end_at: Option<DateTime<Utc>>) -> Self {
        self.map(|query| query.end_at(end_at))
    }

    pub fn between(self, start_at: Option<DateTime<Utc>>, end_at: Option<DateTime<Utc>>) -> Self {
        self.map(|query| query.between(start_at, end_at))
    }

    pub fn user(self, users: impl Into<SubjectSet>) -> MetricsResult<Self> {
        let Self { store, query } = self;
        Ok(Self {
            store,
            query: query.user(users)?,
        })
    }

    pub fn admin(self, admins: impl Into<SubjectSet>) -> MetricsResult<Self> {
        let Self { store, query } = self;
        Ok(Self {
            store,
            query: query.admin(admins)?,
        })
    }

    pub fn period(self, period: Period) -> Self {
        self.map(|query| query.group_by(period))
    }

    pub fn hourly(self) -> Self {
        self.period(Period::Hour)
    }

    pub fn daily(self) -> Self {
        self.period(Period::Day)
    }

    pub fn weekly(self) -> Self {
        self.period(Period::Week)
    }

    pub fn monthly(self) -> Self {
        self.period(Period::Month)
    }

    pub fn yearly(self) -> Self {
        self.period(Period::Year)
    }

    pub async fn aggregate(&self, aggregation: Aggregation) -> MetricsResult<Vec<StatisticsRow>> {
        self.store.statistics(&self.query, aggregation).await
    }

    /// Aggregates by name; unknown names fail with `UnknownAggregation`.
    pub async fn aggregate_named(&self, name: &str) -> MetricsResult<Vec<StatisticsRow>> {
        let aggregation = name.parse::<Aggregation>()?;
        self.aggregate(aggregation).await
    }

    pub async fn count(&self) -> MetricsResult<Vec<StatisticsRow>> {
        self.aggregate(Aggregation::Count).await
    }

    pub async fn avg(&self) -> MetricsResult<Vec<StatisticsRow>> {
        self.aggregate(Aggregation::Avg).await
    }

    pub async fn sum(&self) -> MetricsResult<Vec<StatisticsRow>> {
        self.aggregate(Aggregation::Sum).await
    }

    pub async fn min(&self) -> MetricsResult<Vec<StatisticsRow>> {
        self.aggregate(Aggregation::Min).await
    }

    pub async fn max(&self) -> MetricsResult<Vec<StatisticsRow>> {
        self.aggregate(Aggregation::Max).await
    }

    /// The matching closed records, newest `end_at` first.
    pub async fn records(&self) -> MetricsResult<Vec<MetricRecord>> {
        self.store.records(&self.query).await
    }

    fn map<F>(self, apply: F) -> Self
    where
        F: FnOnce(MetricsQuery) -> MetricsQuery,
    {
        Self {
            store: self.store,
            query: apply(self.query),
        }
    }
}
