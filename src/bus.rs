//! Pool pub/sub seam.
//!
//! Delivery is fan-out and best-effort: every subscriber of a topic in the
//! pool sees each message at least once, in no particular order. Nothing
//! built on top of it may rely on a message actually arriving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Error, Result};

/// Publish/subscribe within one pool.
#[async_trait]
pub trait PoolBus: Send + Sync {
    /// Publish a payload to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Start receiving payloads published to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// A live subscription. Dropping it stops the underlying listener.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    listener: JoinHandle<()>,
}

impl Subscription {
    /// Wrap a receiver fed by a listener task owned by this subscription.
    pub fn new(rx: mpsc::UnboundedReceiver<String>, listener: JoinHandle<()>) -> Self {
        Self { rx, listener }
    }

    /// Next payload, or `None` once the listener has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Topic name for a work type's fast-path notices within a pool.
pub fn work_topic(pool: &str, work_type: &str) -> String {
    format!("workpool.{pool}.{work_type}")
}

// ---------------------------------------------------------------------------
// In-memory bus
// ---------------------------------------------------------------------------

const MEMORY_TOPIC_CAPACITY: usize = 1024;

/// Process-local bus backed by one broadcast channel per topic.
///
/// Clones share topics, so several schedules in one process can stand in
/// for several pool instances.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<String>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| Error::Bus("memory bus poisoned".to_string()))?;
        Ok(topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_TOPIC_CAPACITY).0)
            .clone())
    }
}

#[async_trait]
impl PoolBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error: the notice is simply lost.
        let _ = self.sender(topic)?.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut source = self.sender(topic)?.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        let listener = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, listener))
    }
}
