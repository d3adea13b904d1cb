//! Wallet-changed event stream
//!
//! Fire-and-forget notifications for connected clients. Delivery is not
//! required for correctness; lagging subscribers drop messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use common::decimal::Amount;

/// Emitted after every successful wallet mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEvent {
    /// Wallet owner
    pub owner: Uuid,
    /// Currency of the mutated wallet
    pub currency_id: i32,
    /// Balance after the mutation
    pub balance: Amount,
    /// When the mutation happened
    pub at: DateTime<Utc>,
}

/// Broadcast channel for wallet events
#[derive(Debug, Clone)]
pub struct WalletEvents {
    sender: broadcast::Sender<WalletEvent>,
}

impl WalletEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish; an error just means nobody is listening
    pub fn publish(&self, event: WalletEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for WalletEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}
