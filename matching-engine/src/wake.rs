//! New-order wake channel
//!
//! An at-least-once, possibly-lossy notification channel. The processing
//! loop always falls back to a poll timeout, so consumers tolerate both
//! duplicate and missed messages; nothing here is load-bearing for
//! correctness.

use std::time::Duration;

use async_trait::async_trait;
use common::error::{Error, Result};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Sentinel body published once per successful order submission
pub const WAKE_MESSAGE: &str = "new_order";

/// Outcome of waiting on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A wake message arrived
    Message,
    /// The timeout elapsed; poll anyway
    Timeout,
}

/// Publisher/subscriber handle for the wake signal
#[async_trait]
pub trait WakeChannel: Send + Sync {
    /// Best-effort publish of one wake message
    async fn notify(&self) -> Result<()>;

    /// Open a subscription for the processing loop
    async fn subscribe(&self) -> Result<WakeSubscription>;
}

enum SubscriptionInner {
    Broadcast(broadcast::Receiver<()>),
    Listener(PgListener),
}

/// One consumer's view of the wake channel
pub struct WakeSubscription {
    inner: SubscriptionInner,
}

impl WakeSubscription {
    /// Wait for a wake message or the timeout, whichever comes first
    pub async fn wait(&mut self, timeout: Duration) -> Result<Wake> {
        match &mut self.inner {
            SubscriptionInner::Broadcast(receiver) => {
                match tokio::time::timeout(timeout, receiver.recv()).await {
                    Ok(Ok(())) => Ok(Wake::Message),
                    // Lagging behind just means wake messages piled up
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(Wake::Message),
                    Ok(Err(broadcast::error::RecvError::Closed)) => Ok(Wake::Timeout),
                    Err(_) => Ok(Wake::Timeout),
                }
            }
            SubscriptionInner::Listener(listener) => {
                match tokio::time::timeout(timeout, listener.recv()).await {
                    Ok(Ok(notification)) => {
                        debug!("wake notification: {}", notification.payload());
                        Ok(Wake::Message)
                    }
                    Ok(Err(e)) => Err(Error::Database(e)),
                    Err(_) => Ok(Wake::Timeout),
                }
            }
        }
    }
}

/// In-process wake channel over a tokio broadcast
pub struct InProcessWake {
    sender: broadcast::Sender<()>,
}

impl InProcessWake {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }
}

impl Default for InProcessWake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WakeChannel for InProcessWake {
    async fn notify(&self) -> Result<()> {
        // No subscribers is fine; the loop may not be running
        let _ = self.sender.send(());
        Ok(())
    }

    async fn subscribe(&self) -> Result<WakeSubscription> {
        Ok(WakeSubscription {
            inner: SubscriptionInner::Broadcast(self.sender.subscribe()),
        })
    }
}

/// PostgreSQL LISTEN/NOTIFY wake channel
pub struct PgWakeChannel {
    pool: PgPool,
    channel: String,
}

impl PgWakeChannel {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl WakeChannel for PgWakeChannel {
    async fn notify(&self) -> Result<()> {
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(WAKE_MESSAGE)
            .execute(&self.pool)
            .await;

        // Best-effort: the loop self-polls, so a lost wake is harmless
        if let Err(e) = result {
            warn!("failed to publish wake message: {}", e);
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<WakeSubscription> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(Error::Database)?;
        listener
            .listen(&self.channel)
            .await
            .map_err(Error::Database)?;

        Ok(WakeSubscription {
            inner: SubscriptionInner::Listener(listener),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_a_subscriber() {
        let channel = InProcessWake::new();
        let mut subscription = channel.subscribe().await.unwrap();

        channel.notify().await.unwrap();
        let wake = subscription.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(wake, Wake::Message);
    }

    #[tokio::test]
    async fn wait_times_out_without_messages() {
        let channel = InProcessWake::new();
        let mut subscription = channel.subscribe().await.unwrap();

        let wake = subscription.wait(Duration::from_millis(20)).await.unwrap();
        assert_eq!(wake, Wake::Timeout);
    }

    #[tokio::test]
    async fn notify_without_subscribers_is_harmless() {
        let channel = InProcessWake::new();
        channel.notify().await.unwrap();
    }
}
