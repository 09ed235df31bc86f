use std::fmt;

use async_trait::async_trait;
use log::{debug, error, warn};

use crate::clock::Clock;
use crate::error::MetricsResult;
use crate::record::{MetricKind, MetricRecord, UserRole};
use crate::storage::MetricsStore;
use crate::subject::Subject;

/// Everything a lifecycle needs to act on behalf of one metric.
pub struct MetricContext<'a> {
    pub store: &'a dyn MetricsStore,
    pub clock: &'a dyn Clock,
    pub metric_type: &'a str,
    pub kind: MetricKind,
    pub user: Option<&'a Subject>,
    pub admin: Option<&'a Subject>,
}

impl MetricContext<'_> {
    async fn find_open(&self, subject: &Subject) -> MetricsResult<Option<MetricRecord>> {
        let user_id = self.user.map(|user| user.id.as_str());
        self.store
            .find_open(subject, self.metric_type, self.kind, user_id)
            .await
    }

    fn record_activity(&self, record: &mut MetricRecord, now: chrono::DateTime<chrono::Utc>) {
        record.record_user_activity(UserRole::User, self.user, now);
        record.record_user_activity(UserRole::Admin, self.admin, now);
    }

    /// Shared close path: stamps `end_at`, lets `finish` adjust the record,
    /// then appends history and persists.
    async fn close_with<F>(&self, subject: &Subject, finish: F) -> MetricsResult<bool>
    where
        F: FnOnce(&mut MetricRecord) + Send,
    {
        let Some(mut record) = self.find_open(subject).await? else {
            error!(
                "trying to close unstarted metric {} for {}",
                self.metric_type, subject
            );
            return Ok(false);
        };

        let now = self.clock.now();
        record.end_at = Some(now);
        finish(&mut record);
        record.associate(subject);
        record.append_fired(now);
        self.record_activity(&mut record, now);

        self.store.save(&record).await?;
        debug!(
            "closed metric {} ({}) for {} with count {}",
            self.metric_type, record.id, subject, record.count
        );
        Ok(true)
    }
}

/// Behavior of one metric kind.
///
/// `Ok(false)` reports a refused transition (closing an unstarted metric,
/// double-starting a timer); storage failures come back as `Err`.
#[async_trait]
pub trait Lifecycle: Send + Sync + fmt::Debug {
    fn kind(&self) -> MetricKind;

    async fn add(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool>;

    async fn close(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool>;

    async fn once(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool>;
}

/// Accumulates `increment` into the open record on every `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterLifecycle {
    increment: i64,
}

impl CounterLifecycle {
    pub fn new(increment: i64) -> Self {
        Self { increment }
    }

    pub fn increment(&self) -> i64 {
        self.increment
    }
}

impl Default for CounterLifecycle {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Lifecycle for CounterLifecycle {
    fn kind(&self) -> MetricKind {
        MetricKind::Counter
    }

    async fn add(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool> {
        let now = ctx.clock.now();
        let mut record = match ctx.find_open(subject).await? {
            Some(record) => record,
            None => {
                debug!("starting counter {} for {}", ctx.metric_type, subject);
                MetricRecord::start(ctx.metric_type, MetricKind::Counter, subject.clone(), now)
            }
        };

        record.count += self.increment;
        record.append_fired(now);
        record.associate(subject);
        ctx.record_activity(&mut record, now);

        ctx.store.save(&record).await?;
        Ok(true)
    }

    async fn close(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool> {
        ctx.close_with(subject, |_| {}).await
    }

    /// Both steps have to succeed; a storage error in `add` skips `close`.
    async fn once(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool> {
        let added = self.add(ctx, subject).await?;
        let closed = self.close(ctx, subject).await?;
        Ok(added && closed)
    }
}

/// Measures whole seconds between `add` and `close`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerLifecycle;

#[async_trait]
impl Lifecycle for TimerLifecycle {
    fn kind(&self) -> MetricKind {
        MetricKind::Timer
    }

    async fn add(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool> {
        if let Some(open) = ctx.find_open(subject).await? {
            warn!(
                "timer {} already started for {} ({})",
                ctx.metric_type, subject, open.id
            );
            return Ok(false);
        }

        let now = ctx.clock.now();
        let mut record =
            MetricRecord::start(ctx.metric_type, MetricKind::Timer, subject.clone(), now);
        record.append_fired(now);
        ctx.record_activity(&mut record, now);

        ctx.store.save(&record).await?;
        debug!("started timer {} ({}) for {}", ctx.metric_type, record.id, subject);
        Ok(true)
    }

    async fn close(&self, ctx: &MetricContext<'_>, subject: &Subject) -> MetricsResult<bool> {
        ctx.close_with(subject, |record| {
            record.count = record.elapsed_seconds().unwrap_or_default();
        })
        .await
    }

    /// A timer cannot open and close in one call.
    async fn once(&self, _ctx: &MetricContext<'_>, _subject: &Subject) -> MetricsResult<bool> {
        Ok(false)
    }
}
