//! Pool bus over Postgres LISTEN/NOTIFY.
//!
//! Every instance connected to the same database is in the same pool.
//! NOTIFY is fire-and-forget: a listener that is reconnecting misses
//! whatever was sent in between, which the poll cycle covers.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{PoolBus, Subscription};
use crate::error::{Error, Result};

/// Postgres refuses NOTIFY payloads at or above 8000 bytes.
pub const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Postgres identifiers, channel names included, are cut at 63 bytes.
pub const MAX_CHANNEL_NAME: usize = 63;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// LISTEN/NOTIFY-backed [`PoolBus`].
#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// LISTEN truncates long names silently while `pg_notify` rejects them,
/// so both sides refuse up front.
fn check_channel(topic: &str) -> Result<()> {
    if topic.len() > MAX_CHANNEL_NAME {
        return Err(Error::Bus(format!(
            "channel {topic} is {} bytes, Postgres allows {MAX_CHANNEL_NAME}",
            topic.len()
        )));
    }
    Ok(())
}

#[async_trait]
impl PoolBus for PgBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        check_channel(topic)?;
        if payload.len() > MAX_NOTIFY_PAYLOAD {
            return Err(Error::Bus(format!(
                "payload for {topic} is {} bytes, NOTIFY allows {MAX_NOTIFY_PAYLOAD}",
                payload.len()
            )));
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        check_channel(topic)?;
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(topic).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        debug!(topic = %topic, "pool notification received");
                        if tx.send(notification.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    // PgListener reconnects on the next recv.
                    Err(e) => {
                        warn!(topic = %topic, "PgListener error: {e}, reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Subscription::new(rx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::work_topic;

    #[test]
    fn channel_names_past_the_identifier_limit_are_refused() {
        assert!(check_channel(&work_topic("default", "mail")).is_ok());
        assert!(check_channel(&"x".repeat(MAX_CHANNEL_NAME)).is_ok());

        let long = work_topic(&"billing".repeat(6), "invoice-reminders");
        assert!(long.len() > MAX_CHANNEL_NAME);
        assert!(matches!(check_channel(&long), Err(Error::Bus(_))));
    }
}
