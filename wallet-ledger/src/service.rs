//! Ledger service implementation

use std::sync::Arc;

use chrono::Utc;
use common::decimal::Amount;
use common::error::{Error, Result};
use common::model::wallet::Wallet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{WalletEvent, WalletEvents};
use crate::repository::{InMemoryWalletRepository, PostgresWalletRepository, WalletRepository};
use crate::LedgerConfig;

/// Ledger service for managing wallet balances.
///
/// All balance mutation in the exchange goes through `credit`/`debit` here
/// or through the repository's transaction-composable variants; there is no
/// unguarded write path.
pub struct LedgerService {
    /// Repository for wallet data
    repo: Arc<dyn WalletRepository>,
    /// Wallet-changed event stream
    events: WalletEvents,
}

impl LedgerService {
    /// Create a new in-memory ledger service
    pub fn new() -> Self {
        Self::with_repository(Arc::new(InMemoryWalletRepository::new()))
    }

    /// Create a ledger service over an explicit repository
    pub fn with_repository(repo: Arc<dyn WalletRepository>) -> Self {
        Self {
            repo,
            events: WalletEvents::default(),
        }
    }

    /// Create a PostgreSQL-backed ledger service
    pub async fn with_config(config: &LedgerConfig) -> Result<Self> {
        let repo = Arc::new(PostgresWalletRepository::with_config(config).await?);
        Ok(Self::with_repository(repo))
    }

    /// The underlying repository, for callers composing transactions
    pub fn repository(&self) -> Arc<dyn WalletRepository> {
        self.repo.clone()
    }

    /// Subscribe to wallet-changed events
    pub fn events(&self) -> &WalletEvents {
        &self.events
    }

    /// Get a wallet balance
    pub async fn balance(&self, owner: Uuid, currency_id: i32) -> Result<Option<Wallet>> {
        self.repo.wallet(owner, currency_id).await
    }

    /// Get all wallets for an owner
    pub async fn balances(&self, owner: Uuid) -> Result<Vec<Wallet>> {
        self.repo.wallets_for(owner).await
    }

    /// Credit a wallet, creating it if absent
    pub async fn credit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        if amount <= Amount::ZERO {
            return Err(Error::Validation(format!(
                "credit amount must be positive, got {}",
                amount
            )));
        }

        debug!("Crediting {} of currency {} to {}", amount, currency_id, owner);
        let wallet = self.repo.credit(owner, currency_id, amount).await?;
        self.notify(&wallet);
        Ok(wallet)
    }

    /// Debit a wallet; rejects overdrafts with `InsufficientFunds`
    pub async fn debit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        if amount <= Amount::ZERO {
            return Err(Error::Validation(format!(
                "debit amount must be positive, got {}",
                amount
            )));
        }

        debug!("Debiting {} of currency {} from {}", amount, currency_id, owner);
        let wallet = self.repo.debit(owner, currency_id, amount).await?;
        self.notify(&wallet);
        Ok(wallet)
    }

    /// Operator deposit (external mint); the only way value enters the system
    pub async fn deposit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        info!("Depositing {} of currency {} to {}", amount, currency_id, owner);
        self.credit(owner, currency_id, amount).await
    }

    /// Operator withdrawal (external burn)
    pub async fn withdraw(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        info!("Withdrawing {} of currency {} from {}", amount, currency_id, owner);
        self.debit(owner, currency_id, amount).await
    }

    fn notify(&self, wallet: &Wallet) {
        self.events.publish(WalletEvent {
            owner: wallet.owner,
            currency_id: wallet.currency_id,
            balance: wallet.balance,
            at: Utc::now(),
        });
    }
}

impl Default for LedgerService {
    fn default() -> Self {
        Self::new()
    }
}
