//! Timeout tracking
//!
//! A node's timeout configuration selects a dimension. The tracker registered
//! for that dimension computes the deadline of the [`TimeoutInstance`] bound to
//! the node execution. Expiry is not applied here: the monitor registers a
//! MARK_EXPIRED interrupt so expiry and user aborts share one path.

pub mod monitor;

use crate::core::TimeoutObtainment;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use monitor::TimeoutMonitor;

/// Wall-clock deadline from node start
pub const ABSOLUTE: &str = "ABSOLUTE";

/// Deadline reset on every progress heartbeat
pub const ACTIVE: &str = "ACTIVE";

#[derive(Debug, Error)]
pub enum TimeoutError {
    #[error("No timeout tracker for dimension '{0}'")]
    UnknownDimension(String),
}

/// Timeout state bound to one node execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInstance {
    pub id: Uuid,
    pub dimension: String,
    pub timeout_secs: u64,
    pub started_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,

    /// Set once expiry was claimed, so it fires only once
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
}

impl TimeoutInstance {
    pub fn new(dimension: impl Into<String>, timeout_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dimension: dimension.into(),
            timeout_secs,
            started_at: now,
            last_progress_at: now,
            expired_at: None,
        }
    }

    /// `from + timeout_secs`, or `None` when that lies beyond the representable range
    fn deadline_from(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.timeout_secs).ok()?;
        from.checked_add_signed(ChronoDuration::try_seconds(secs)?)
    }
}

/// Deadline policy for one dimension
pub trait TimeoutTracker: Send + Sync {
    /// `None` means the instance never expires
    fn deadline(&self, instance: &TimeoutInstance) -> Option<DateTime<Utc>>;

    /// Record a progress heartbeat
    fn on_progress(&self, _instance: &mut TimeoutInstance, _at: DateTime<Utc>) {}

    fn is_expired(&self, instance: &TimeoutInstance, now: DateTime<Utc>) -> bool {
        instance.expired_at.is_none() && self.deadline(instance).is_some_and(|deadline| now >= deadline)
    }
}

/// Deadline counted from the moment the node started
pub struct AbsoluteTimeoutTracker;

impl TimeoutTracker for AbsoluteTimeoutTracker {
    fn deadline(&self, instance: &TimeoutInstance) -> Option<DateTime<Utc>> {
        instance.deadline_from(instance.started_at)
    }
}

/// Deadline counted from the last progress heartbeat
pub struct ActiveTimeoutTracker;

impl TimeoutTracker for ActiveTimeoutTracker {
    fn deadline(&self, instance: &TimeoutInstance) -> Option<DateTime<Utc>> {
        instance.deadline_from(instance.last_progress_at)
    }

    fn on_progress(&self, instance: &mut TimeoutInstance, at: DateTime<Utc>) {
        if at > instance.last_progress_at {
            instance.last_progress_at = at;
        }
    }
}

/// Trackers keyed by dimension
#[derive(Clone, Default)]
pub struct TimeoutTrackerFactory {
    trackers: HashMap<String, Arc<dyn TimeoutTracker>>,
}

impl TimeoutTrackerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the ABSOLUTE and ACTIVE dimensions
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(ABSOLUTE, Arc::new(AbsoluteTimeoutTracker));
        factory.register(ACTIVE, Arc::new(ActiveTimeoutTracker));
        factory
    }

    pub fn register(&mut self, dimension: impl Into<String>, tracker: Arc<dyn TimeoutTracker>) -> &mut Self {
        self.trackers.insert(dimension.into(), tracker);
        self
    }

    pub fn tracker(&self, dimension: &str) -> Result<Arc<dyn TimeoutTracker>, TimeoutError> {
        self.trackers
            .get(dimension)
            .cloned()
            .ok_or_else(|| TimeoutError::UnknownDimension(dimension.to_string()))
    }

    /// Bind a new timeout instance for a node that just started
    pub fn create(&self, obtainment: &TimeoutObtainment, now: DateTime<Utc>) -> Result<TimeoutInstance, TimeoutError> {
        self.tracker(&obtainment.dimension)?;
        Ok(TimeoutInstance::new(obtainment.dimension.clone(), obtainment.timeout_secs, now))
    }

    pub fn is_expired(&self, instance: &TimeoutInstance, now: DateTime<Utc>) -> bool {
        self.tracker(&instance.dimension)
            .map(|t| t.is_expired(instance, now))
            .unwrap_or(false)
    }

    pub fn on_progress(&self, instance: &mut TimeoutInstance, at: DateTime<Utc>) {
        if let Ok(tracker) = self.tracker(&instance.dimension) {
            tracker.on_progress(instance, at);
        }
    }
}
