use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MetricsConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::record::MetricKind;
use crate::storage::format_timestamp;
use crate::subject::Subject;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Hour,
    Day,
    #[default]
    Week,
    Month,
    Year,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Grouping key computed from `end_at`.
    ///
    /// Week is the ISO week number; the others extract the calendar field,
    /// so `day` is the day of the month and `hour` the hour of the day.
    pub(crate) fn bucket_sql(self) -> &'static str {
        match self {
            Self::Hour => "CAST(strftime('%H', end_at) AS INTEGER)",
            Self::Day => "CAST(strftime('%d', end_at) AS INTEGER)",
            Self::Week => "iso_week(end_at)",
            Self::Month => "CAST(strftime('%m', end_at) AS INTEGER)",
            Self::Year => "CAST(strftime('%Y', end_at) AS INTEGER)",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Ok(Self::Hour),
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            "year" | "yearly" => Ok(Self::Year),
            _ => Err(MetricsError::UnknownPeriod(value.to_string())),
        }
    }
}

/// Users (or admins) to filter statistics by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubjectSet {
    #[default]
    Any,
    One(Subject),
    Many(Vec<Subject>),
}

impl From<Subject> for SubjectSet {
    fn from(subject: Subject) -> Self {
        Self::One(subject)
    }
}

impl From<&Subject> for SubjectSet {
    fn from(subject: &Subject) -> Self {
        Self::One(subject.clone())
    }
}

impl From<Option<Subject>> for SubjectSet {
    fn from(subject: Option<Subject>) -> Self {
        subject.map_or(Self::Any, Self::One)
    }
}

impl From<Vec<Subject>> for SubjectSet {
    fn from(subjects: Vec<Subject>) -> Self {
        Self::Many(subjects)
    }
}

impl From<&[Subject]> for SubjectSet {
    fn from(subjects: &[Subject]) -> Self {
        Self::Many(subjects.to_vec())
    }
}

/// Filters over the closed records of one metric type.
///
/// Every filter method appends a condition; all conditions are ANDed.
#[derive(Debug, Clone)]
pub struct MetricsQuery {
    metric_type: String,
    config: MetricsConfig,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    conditions: Vec<String>,
    params: Vec<String>,
    period: Period,
}

impl MetricsQuery {
    /// Date bounds default to the start of `now`'s month and `now`.
    pub fn new(metric_type: impl Into<String>, config: &MetricsConfig, now: DateTime<Utc>) -> Self {
        Self {
            metric_type: metric_type.into(),
            config: config.clone(),
            start_at: start_of_month(now),
            end_at: now,
            conditions: Vec::new(),
            params: Vec::new(),
            period: Period::default(),
        }
    }

    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn start_bound(&self) -> DateTime<Utc> {
        self.start_at
    }

    pub fn end_bound(&self) -> DateTime<Utc> {
        self.end_at
    }

    /// Keep records closed at or after `start_at` (or the stored start bound).
    pub fn start_at(mut self, start_at: Option<DateTime<Utc>>) -> Self {
        if let Some(start_at) = start_at {
            self.start_at = start_at;
        }
        let bound = format_timestamp(self.start_at);
        self.push("end_at >= ?", [bound]);
        self
    }

    /// Keep records closed at or before `end_at` (or the stored end bound).
    pub fn end_at(mut self, end_at: Option<DateTime<Utc>>) -> Self {
        if let Some(end_at) = end_at {
            self.end_at = end_at;
        }
        let bound = format_timestamp(self.end_at);
        self.push("end_at <= ?", [bound]);
        self
    }

    /// Keep records closed inside `[start, end]`, both ends inclusive.
    pub fn between(mut self, start_at: Option<DateTime<Utc>>, end_at: Option<DateTime<Utc>>) -> Self {
        if let Some(start_at) = start_at {
            self.start_at = start_at;
        }
        if let Some(end_at) = end_at {
            self.end_at = end_at;
        }
        let bounds = [format_timestamp(self.start_at), format_timestamp(self.end_at)];
        self.push("end_at BETWEEN ? AND ?", bounds);
        self
    }

    /// Keep only records of one metric kind.
    pub fn kind(mut self, kind: MetricKind) -> Self {
        self.push("kind = ?", [kind.as_str().to_string()]);
        self
    }

    pub fn user(self, users: impl Into<SubjectSet>) -> MetricsResult<Self> {
        self.filter_subjects("user_id", users.into())
    }

    pub fn admin(self, admins: impl Into<SubjectSet>) -> MetricsResult<Self> {
        self.filter_subjects("admin_id", admins.into())
    }

    pub fn group_by(mut self, period: Period) -> Self {
        self.period = period;
        self
    }

    pub fn hourly(self) -> Self {
        self.group_by(Period::Hour)
    }

    pub fn daily(self) -> Self {
        self.group_by(Period::Day)
    }

    pub fn weekly(self) -> Self {
        self.group_by(Period::Week)
    }

    pub fn monthly(self) -> Self {
        self.group_by(Period::Month)
    }

    pub fn yearly(self) -> Self {
        self.group_by(Period::Year)
    }

    /// The SQL condition over the `metrics` table and its bound parameters,
    /// for callers building their own queries.
    pub fn where_clause(&self) -> (String, Vec<String>) {
        let mut conditions = vec!["type = ?".to_string(), "end_at IS NOT NULL".to_string()];
        conditions.extend(self.conditions.iter().cloned());

        let mut params = Vec::with_capacity(self.params.len() + 1);
        params.push(self.metric_type.clone());
        params.extend(self.params.iter().cloned());

        (conditions.join(" AND "), params)
    }

    fn filter_subjects(mut self, column: &str, subjects: SubjectSet) -> MetricsResult<Self> {
        let ids = match subjects {
            SubjectSet::Any => return Ok(self),
            SubjectSet::One(subject) => vec![subject],
            SubjectSet::Many(subjects) if subjects.is_empty() => return Ok(self),
            SubjectSet::Many(subjects) => subjects,
        };

        let mut values = Vec::with_capacity(ids.len());
        for subject in ids {
            self.config.check_user_kind(Some(&subject))?;
            values.push(subject.id);
        }

        if values.len() == 1 {
            self.push(&format!("{} = ?", column), values);
        } else {
            let placeholders = vec!["?"; values.len()].join(", ");
            self.push(&format!("{} IN ({})", column, placeholders), values);
        }
        Ok(self)
    }

    fn push<I>(&mut self, condition: &str, params: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.conditions.push(condition.to_string());
        self.params.extend(params);
    }
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive().with_day(1).unwrap_or_else(|| now.date_naive());
    first.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{MetricsQuery, Period, SubjectSet};
    use crate::config::MetricsConfig;
    use crate::error::MetricsError;
    use crate::record::MetricKind;
    use crate::subject::Subject;

    fn query() -> MetricsQuery {
        let now = Utc
            .with_ymd_and_hms(2026, 2, 18, 15, 30, 0)
            .single()
            .expect("valid datetime");
        MetricsQuery::new("views", &MetricsConfig::default(), now)
    }

    #[test]
    fn base_clause_selects_closed_records_of_the_type() {
        let (clause, params) = query().where_clause();

        assert_eq!(clause, "type = ? AND end_at IS NOT NULL");
        assert_eq!(params, vec!["views".to_string()]);
    }

    #[test]
    fn default_bounds_are_month_start_and_now() {
        let (clause, params) = query().start_at(None).end_at(None).where_clause();

        assert!(clause.ends_with("end_at >= ? AND end_at <= ?"));
        assert_eq!(params[1], "2026-02-01T00:00:00.000000000Z");
        assert_eq!(params[2], "2026-02-18T15:30:00.000000000Z");
    }

    #[test]
    fn between_reuses_stored_bounds() {
        let start = Utc
            .with_ymd_and_hms(2026, 1, 5, 0, 0, 0)
            .single()
            .expect("valid datetime");
        let (clause, params) = query().between(Some(start), None).where_clause();

        assert!(clause.ends_with("end_at BETWEEN ? AND ?"));
        assert_eq!(params[1], "2026-01-05T00:00:00.000000000Z");
        assert_eq!(params[2], "2026-02-18T15:30:00.000000000Z");
    }

    #[test]
    fn kind_filter_binds_the_kind_name() {
        let (clause, params) = query().kind(MetricKind::Timer).where_clause();

        assert!(clause.ends_with("kind = ?"));
        assert_eq!(params[1], "timer");
    }

    #[test]
    fn user_filter_uses_equality_or_membership() {
        let single = query()
            .user(Subject::new("User", "1"))
            .expect("user filter");
        assert!(single.where_clause().0.ends_with("user_id = ?"));

        let many = query()
            .admin(vec![Subject::new("User", "1"), Subject::new("User", "2")])
            .expect("admin filter");
        let (clause, params) = many.where_clause();
        assert!(clause.ends_with("admin_id IN (?, ?)"));
        assert_eq!(&params[1..], &["1".to_string(), "2".to_string()]);

        let untouched = query().user(SubjectSet::Many(Vec::new())).expect("no-op");
        assert_eq!(untouched.where_clause().1.len(), 1);
    }

    #[test]
    fn user_filter_rejects_non_user_subjects() {
        let error = query()
            .user(vec![Subject::new("User", "1"), Subject::new("Order", "9")])
            .expect_err("orders are not users");

        assert!(matches!(error, MetricsError::InvalidSubjectKind { .. }));
    }

    #[test]
    fn period_parses_names_and_defaults_to_week() {
        assert_eq!(query().period(), Period::Week);
        assert_eq!("month".parse::<Period>().expect("month"), Period::Month);
        assert_eq!("Daily".parse::<Period>().expect("daily"), Period::Day);
        assert!(matches!(
            "fortnight".parse::<Period>(),
            Err(MetricsError::UnknownPeriod(_))
        ));
        assert_eq!(query().yearly().period(), Period::Year);
    }
}
