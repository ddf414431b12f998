//! Core data model.
//!
//! A work record is one durable unit of deferred work, keyed by a
//! caller-chosen reference id. The payload is opaque to the scheduler.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bound shared by every payload type a schedule can carry.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// Work Record
// ---------------------------------------------------------------------------

/// A durable work record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord<P> {
    /// Persisted identity, assigned at creation.
    pub id: WorkId,

    /// Caller-supplied key for the logical unit of work. Unique per work type.
    pub reference_id: String,

    /// True while some executor in the pool holds a claim.
    pub acquired: bool,

    /// Earliest moment the record is eligible for a new claim.
    pub next_time: DateTime<Utc>,

    /// When the current (or last) claim was taken or released.
    pub acquiring_time: Option<DateTime<Utc>>,

    /// Work-specific data. The scheduler doesn't interpret it.
    pub payload: P,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<P> WorkRecord<P> {
    /// Due for a new claim at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.acquired && self.next_time <= now
    }

    /// Claimed before `cutoff` and never released?
    pub fn is_stuck(&self, cutoff: DateTime<Utc>) -> bool {
        self.acquired && self.acquiring_time.is_some_and(|t| t < cutoff)
    }
}

/// Newtype for persisted record ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Posting
// ---------------------------------------------------------------------------

/// How a posted record reaches an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostMode {
    /// Durable write only; picked up by the poll cycle once due.
    Scheduled,
    /// Durable write, then the fast path: a pool notification when a
    /// publisher is attached, otherwise a local enqueue.
    Immediate,
    /// Durable write, then a local enqueue on this process only.
    Local,
}

impl PostMode {
    /// Does this mode hand the record to the fast path after the write?
    pub fn is_immediate(self) -> bool {
        matches!(self, PostMode::Immediate | PostMode::Local)
    }
}

impl std::fmt::Display for PostMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostMode::Scheduled => "scheduled",
            PostMode::Immediate => "immediate",
            PostMode::Local => "local",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PostMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(PostMode::Scheduled),
            "immediate" => Ok(PostMode::Immediate),
            "local" => Ok(PostMode::Local),
            other => Err(crate::error::Error::Other(format!(
                "unknown post mode: {other}"
            ))),
        }
    }
}

/// Builder for posting work. `reference_id` is the dedup key: posting the
/// same id again updates the existing record.
#[derive(Debug, Clone)]
pub struct NewWork<P> {
    pub(crate) reference_id: String,
    pub(crate) payload: P,
    pub(crate) next_time: Option<DateTime<Utc>>,
}

impl<P> NewWork<P> {
    pub fn new(reference_id: impl Into<String>, payload: P) -> Self {
        Self {
            reference_id: reference_id.into(),
            payload,
            next_time: None,
        }
    }

    /// Earliest run time. Unset means the schedule picks a default per mode.
    pub fn next_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_time = Some(at);
        self
    }

    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What a work handler reports after one execution.
///
/// Retry policy lives entirely in `done` and `next_time`; an error is
/// logged but never stops a retry on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkOutcome {
    pub done: bool,
    pub next_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkOutcome {
    /// Finished for good; the record is deleted.
    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    /// Not finished; retry after the default invocation interval.
    pub fn retry() -> Self {
        Self::default()
    }

    /// Not finished; retry no earlier than `at`.
    pub fn retry_at(at: DateTime<Utc>) -> Self {
        Self {
            next_time: Some(at),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Result of the claim transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome<P> {
    /// Row gone: deleted or completed elsewhere.
    Missing,
    /// Someone else holds the claim.
    AlreadyAcquired,
    /// Claim taken; the record as committed.
    Claimed(WorkRecord<P>),
}

/// How the finalize transaction leaves the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Terminal: delete the row.
    Complete,
    /// Un-acquire and push `next_time` out.
    Reschedule {
        next_time: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}
