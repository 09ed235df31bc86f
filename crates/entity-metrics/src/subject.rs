use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MetricsResult;
use crate::metric::Metric;

/// The entity a metric is measured on, or a user/admin acting on it.
///
/// `kind` is the application-level entity name (`Order`, `Session`, `User`)
/// and `id` its identifier, together forming the polymorphic key stored in
/// `metricable_type` / `metricable_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Subject {
    pub kind: String,
    pub id: String,
}

impl Subject {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Implemented by application entities that can be measured.
///
/// Only `subject` is required; the metric operations are provided so an entity
/// reads `order.start_metrics(&checkout_timer)`.
#[async_trait]
pub trait Metricable: Sync {
    fn subject(&self) -> Subject;

    /// Start watching a metric (same as `add_metrics`).
    async fn start_metrics(&self, metric: &Metric) -> MetricsResult<bool> {
        self.add_metrics(metric).await
    }

    async fn add_metrics(&self, metric: &Metric) -> MetricsResult<bool> {
        metric.add(&self.subject()).await
    }

    async fn close_metrics(&self, metric: &Metric) -> MetricsResult<bool> {
        metric.close(&self.subject()).await
    }

    async fn once_metrics(&self, metric: &Metric) -> MetricsResult<bool> {
        metric.once(&self.subject()).await
    }
}

impl Metricable for Subject {
    fn subject(&self) -> Subject {
        self.clone()
    }
}
