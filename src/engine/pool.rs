//! Pool relay: fast-path "work is ready" notices between instances.
//!
//! A notice is only a hint. The record is already durable when it is
//! published, so a lost notice just means the work waits for the next poll
//! tick. Every subscribed instance gets every notice; the claim transaction
//! decides which one actually runs it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::schedule::WorkSchedule;
use crate::bus::{PoolBus, work_topic};
use crate::error::{Error, Result};
use crate::model::{Payload, PostMode, WorkRecord};
use crate::telemetry::metrics;

/// Wire form of a fast-path notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub work_type: String,
    pub mode: PostMode,
    /// Tenancy scope the record belongs to, if any.
    pub scope: Option<String>,
    pub record: WorkRecord<P>,
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publishes fast-path notices for one work type.
#[derive(Clone)]
pub struct PoolPublisher {
    bus: Arc<dyn PoolBus>,
    work_type: String,
    topic: String,
}

impl PoolPublisher {
    pub fn new(bus: Arc<dyn PoolBus>, pool: &str, work_type: impl Into<String>) -> Self {
        let work_type = work_type.into();
        Self {
            bus,
            topic: work_topic(pool, &work_type),
            work_type,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Tell the pool a record is ready now.
    pub async fn invoke_work<P: Payload>(
        &self,
        record: &WorkRecord<P>,
        mode: PostMode,
        scope: Option<&str>,
    ) -> Result<()> {
        let envelope = EnvelopeRef {
            work_type: &self.work_type,
            mode,
            scope,
            record,
        };
        let payload = serde_json::to_string(&envelope)?;
        let published = self.bus.publish(&self.topic, &payload).await;

        metrics::fastpath_published().add(
            1,
            &[
                KeyValue::new("work_type", self.work_type.clone()),
                KeyValue::new("result", if published.is_ok() { "ok" } else { "error" }),
            ],
        );
        if published.is_ok() {
            debug!(
                topic = %self.topic,
                reference_id = %record.reference_id,
                "fast-path notice published"
            );
        }
        published
    }
}

/// Borrowing twin of [`Envelope`] so publishing doesn't clone the record.
#[derive(Serialize)]
struct EnvelopeRef<'a, P> {
    work_type: &'a str,
    mode: PostMode,
    scope: Option<&'a str>,
    record: &'a WorkRecord<P>,
}

// ---------------------------------------------------------------------------
// Scope registry
// ---------------------------------------------------------------------------

/// Maps a tenancy scope to the local schedule that serves it. The unscoped
/// schedule is registered under `None`.
pub struct ScheduleRegistry<P: Payload> {
    schedules: RwLock<HashMap<Option<String>, WorkSchedule<P>>>,
}

impl<P: Payload> Default for ScheduleRegistry<P> {
    fn default() -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
        }
    }
}

impl<P: Payload> ScheduleRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving only unscoped notices.
    pub fn single(schedule: WorkSchedule<P>) -> Self {
        let registry = Self::new();
        registry.register(None, schedule);
        registry
    }

    pub fn register(&self, scope: Option<String>, schedule: WorkSchedule<P>) {
        if let Ok(mut schedules) = self.schedules.write() {
            schedules.insert(scope, schedule);
        }
    }

    pub fn unregister(&self, scope: Option<&str>) -> Option<WorkSchedule<P>> {
        self.schedules
            .write()
            .ok()
            .and_then(|mut schedules| schedules.remove(&scope.map(str::to_string)))
    }

    pub fn resolve(&self, scope: Option<&str>) -> Option<WorkSchedule<P>> {
        self.schedules
            .read()
            .ok()
            .and_then(|schedules| schedules.get(&scope.map(str::to_string)).cloned())
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Background listener that feeds fast-path notices into local schedules.
pub struct PoolSubscriber {
    topic: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PoolSubscriber {
    /// Subscribe to `work_type`'s topic in `pool` and start relaying.
    ///
    /// The subscription is live when this returns, so anything published
    /// afterwards is seen.
    pub async fn spawn<P: Payload>(
        bus: Arc<dyn PoolBus>,
        pool: &str,
        work_type: &str,
        registry: Arc<ScheduleRegistry<P>>,
    ) -> Result<Self> {
        let topic = work_topic(pool, work_type);
        let mut subscription = bus.subscribe(&topic).await?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let listen_topic = topic.clone();
        let expected_type = work_type.to_string();
        let handle = tokio::spawn(async move {
            info!(topic = %listen_topic, "pool subscriber listening");
            loop {
                let payload = tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                    payload = subscription.recv() => payload,
                };
                let Some(payload) = payload else {
                    warn!(topic = %listen_topic, "pool subscription closed");
                    break;
                };
                relay(&payload, &expected_type, &registry);
            }
            info!(topic = %listen_topic, "pool subscriber stopped");
        });

        Ok(Self {
            topic,
            shutdown_tx,
            handle,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop listening and wait for the listener to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle
            .await
            .map_err(|e| Error::Other(format!("pool subscriber task failed: {e}")))
    }
}

/// Decode one notice and hand its record to the schedule for its scope.
fn relay<P: Payload>(payload: &str, expected_type: &str, registry: &ScheduleRegistry<P>) {
    let envelope: Envelope<P> = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "dropping undecodable pool notice");
            return;
        }
    };
    if envelope.work_type != expected_type {
        debug!(work_type = %envelope.work_type, "ignoring notice for another work type");
        return;
    }

    let scope = envelope.scope.as_deref();
    let Some(schedule) = registry.resolve(scope) else {
        debug!(?scope, "no local schedule for scope, leaving notice to its owner");
        return;
    };

    let reference_id = envelope.record.reference_id.clone();
    if schedule.invoke_work(envelope.record) {
        debug!(reference_id = %reference_id, ?scope, "fast-path work queued");
    } else {
        debug!(reference_id = %reference_id, "fast-path work not queued");
    }
}
