use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subject::Subject;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Timer,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Timer => "timer",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "counter" => Some(Self::Counter),
            "timer" => Some(Self::Timer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

/// History kept in the `data` column.
///
/// Keys other than `fired_at`, `user` and `admin` are carried through
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricData {
    #[serde(default)]
    pub fired_at: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user: BTreeMap<String, Vec<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub admin: BTreeMap<String, Vec<DateTime<Utc>>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    pub id: String,
    pub metric_type: String,
    pub kind: MetricKind,
    pub count: i64,
    pub data: MetricData,
    pub is_failed: bool,
    pub metricable: Subject,
    pub user_id: Option<String>,
    pub admin_id: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

impl MetricRecord {
    /// A fresh, unsaved, open record.
    pub fn start(
        metric_type: impl Into<String>,
        kind: MetricKind,
        metricable: Subject,
        start_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metric_type: metric_type.into(),
            kind,
            count: 0,
            data: MetricData::default(),
            is_failed: false,
            metricable,
            user_id: None,
            admin_id: None,
            start_at,
            end_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_at.is_none()
    }

    pub fn associate(&mut self, metricable: &Subject) {
        self.metricable = metricable.clone();
    }

    pub fn append_fired(&mut self, now: DateTime<Utc>) {
        self.data.fired_at.push(now);
    }

    /// Whole seconds between `start_at` and `end_at`.
    ///
    /// The difference is absolute: an `end_at` before `start_at` (clock skew)
    /// still yields a positive duration.
    pub fn elapsed_seconds(&self) -> Option<i64> {
        self.end_at
            .map(|end_at| end_at.signed_duration_since(self.start_at).num_seconds().abs())
    }

    pub fn role_id(&self, role: UserRole) -> Option<&str> {
        match role {
            UserRole::User => self.user_id.as_deref(),
            UserRole::Admin => self.admin_id.as_deref(),
        }
    }

    /// Links `candidate` to `role` if nothing is linked yet, then logs `now`
    /// under the linked subject's id.
    pub fn record_user_activity(
        &mut self,
        role: UserRole,
        candidate: Option<&Subject>,
        now: DateTime<Utc>,
    ) {
        let slot = match role {
            UserRole::User => &mut self.user_id,
            UserRole::Admin => &mut self.admin_id,
        };
        if slot.is_none() {
            *slot = candidate.map(|subject| subject.id.clone());
        }

        let Some(linked) = slot.clone() else {
            return;
        };
        let history = match role {
            UserRole::User => &mut self.data.user,
            UserRole::Admin => &mut self.data.admin,
        };
        history.entry(linked).or_default().push(now);
    }
}
