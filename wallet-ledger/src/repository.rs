//! Repository for wallet data

use async_trait::async_trait;
use chrono::Utc;
use common::decimal::Amount;
use common::error::{Error, Result};
use common::model::wallet::Wallet;
use dashmap::DashMap;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::LedgerConfig;

/// Wallet repository trait defining the interface for balance storage.
///
/// `credit` and `debit` are atomic per wallet: concurrent callers touching
/// the same (owner, currency) serialize on a row lock (PostgreSQL) or a
/// map-shard lock (in-memory), so updates are never lost.
#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Get a wallet if it exists
    async fn wallet(&self, owner: Uuid, currency_id: i32) -> Result<Option<Wallet>>;

    /// Get all wallets for an owner
    async fn wallets_for(&self, owner: Uuid) -> Result<Vec<Wallet>>;

    /// Atomically add funds, creating the wallet row if absent
    async fn credit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet>;

    /// Atomically remove funds; fails with `InsufficientFunds` when the
    /// balance cannot cover the amount, leaving the wallet untouched
    async fn debit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet>;
}

/// In-memory repository for wallet data
pub struct InMemoryWalletRepository {
    /// Wallets by (owner, currency)
    wallets: DashMap<(Uuid, i32), Wallet>,
}

impl InMemoryWalletRepository {
    /// Create a new in-memory wallet repository
    pub fn new() -> Self {
        Self {
            wallets: DashMap::new(),
        }
    }

    /// Sum of all balances held in a currency; used by conservation checks
    pub fn total_balance(&self, currency_id: i32) -> Amount {
        self.wallets
            .iter()
            .filter(|entry| entry.key().1 == currency_id)
            .map(|entry| entry.value().balance)
            .sum()
    }
}

impl Default for InMemoryWalletRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletRepository for InMemoryWalletRepository {
    async fn wallet(&self, owner: Uuid, currency_id: i32) -> Result<Option<Wallet>> {
        Ok(self.wallets.get(&(owner, currency_id)).map(|w| w.clone()))
    }

    async fn wallets_for(&self, owner: Uuid) -> Result<Vec<Wallet>> {
        let wallets = self
            .wallets
            .iter()
            .filter_map(|entry| {
                let ((o, _), wallet) = entry.pair();
                if *o == owner {
                    Some(wallet.clone())
                } else {
                    None
                }
            })
            .collect();

        Ok(wallets)
    }

    async fn credit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        // The entry guard holds the shard lock for the whole mutation
        let mut entry = self
            .wallets
            .entry((owner, currency_id))
            .or_insert_with(|| Wallet::new(owner, currency_id));
        entry.credit(amount);
        Ok(entry.clone())
    }

    async fn debit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        let mut entry = self
            .wallets
            .get_mut(&(owner, currency_id))
            .ok_or_else(|| {
                Error::InsufficientFunds(format!(
                    "no wallet for owner {} in currency {}",
                    owner, currency_id
                ))
            })?;
        entry.debit(amount).map_err(Error::InsufficientFunds)?;
        Ok(entry.clone())
    }
}

/// PostgreSQL repository for wallet data
pub struct PostgresWalletRepository {
    /// Database connection pool
    pool: PgPool,
}

impl PostgresWalletRepository {
    /// Create a new PostgreSQL wallet repository over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new PostgreSQL wallet repository with configuration
    pub async fn with_config(config: &LedgerConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_pool_size)
            .connect(&config.database_url)
            .await
            .map_err(Error::Database)?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WalletRepository for PostgresWalletRepository {
    async fn wallet(&self, owner: Uuid, currency_id: i32) -> Result<Option<Wallet>> {
        debug!("Getting wallet from database: {} / {}", owner, currency_id);

        let row = sqlx::query(
            "SELECT owner, currency_id, balance::text AS balance, created_at, modified_at
             FROM wallets
             WHERE owner = $1 AND currency_id = $2",
        )
        .bind(owner)
        .bind(currency_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| pg::wallet_from_row(&row)).transpose()
    }

    async fn wallets_for(&self, owner: Uuid) -> Result<Vec<Wallet>> {
        let rows = sqlx::query(
            "SELECT owner, currency_id, balance::text AS balance, created_at, modified_at
             FROM wallets
             WHERE owner = $1
             ORDER BY currency_id",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pg::wallet_from_row).collect()
    }

    async fn credit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        let mut tx = self.pool.begin().await?;
        let wallet = pg::credit_in_tx(&mut tx, owner, currency_id, amount).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    async fn debit(&self, owner: Uuid, currency_id: i32, amount: Amount) -> Result<Wallet> {
        let mut tx = self.pool.begin().await?;
        let wallet = pg::debit_in_tx(&mut tx, owner, currency_id, amount).await?;
        tx.commit().await?;
        Ok(wallet)
    }
}

/// Transaction-composable wallet operations.
///
/// Settlement and order reservation need wallet mutations inside a larger
/// transaction (trade insert + order updates + credits as one atomic unit),
/// so the locked read-then-write lives here as free functions over an open
/// transaction.
pub mod pg {
    use sqlx::postgres::PgRow;
    use sqlx::{Postgres, Transaction};

    use super::*;

    pub(crate) fn wallet_from_row(row: &PgRow) -> Result<Wallet> {
        let balance: String = row.get("balance");
        let balance = balance
            .parse::<Amount>()
            .map_err(|e| Error::Internal(format!("Invalid balance format: {}", e)))?;

        Ok(Wallet {
            owner: row.get("owner"),
            currency_id: row.get("currency_id"),
            balance,
            created_at: row.get("created_at"),
            modified_at: row.get("modified_at"),
        })
    }

    /// Lock a wallet row for the remainder of the transaction, creating it
    /// first when absent (lazy get-or-create).
    pub async fn lock_or_create(
        tx: &mut Transaction<'_, Postgres>,
        owner: Uuid,
        currency_id: i32,
    ) -> Result<Wallet> {
        // INSERT .. ON CONFLICT DO NOTHING then SELECT .. FOR UPDATE keeps
        // the lock ordering identical for both the create and update paths.
        sqlx::query(
            "INSERT INTO wallets (owner, currency_id, balance)
             VALUES ($1, $2, '0')
             ON CONFLICT (owner, currency_id) DO NOTHING",
        )
        .bind(owner)
        .bind(currency_id)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query(
            "SELECT owner, currency_id, balance::text AS balance, created_at, modified_at
             FROM wallets
             WHERE owner = $1 AND currency_id = $2
             FOR UPDATE",
        )
        .bind(owner)
        .bind(currency_id)
        .fetch_one(&mut **tx)
        .await?;

        wallet_from_row(&row)
    }

    async fn write_balance(
        tx: &mut Transaction<'_, Postgres>,
        wallet: &Wallet,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wallets SET balance = $3::numeric, modified_at = $4
             WHERE owner = $1 AND currency_id = $2",
        )
        .bind(wallet.owner)
        .bind(wallet.currency_id)
        .bind(wallet.balance.to_string())
        .bind(wallet.modified_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Credit inside an open transaction
    pub async fn credit_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        owner: Uuid,
        currency_id: i32,
        amount: Amount,
    ) -> Result<Wallet> {
        let mut wallet = lock_or_create(tx, owner, currency_id).await?;
        wallet.balance += amount;
        wallet.modified_at = Utc::now();
        write_balance(tx, &wallet).await?;
        Ok(wallet)
    }

    /// Debit inside an open transaction; `InsufficientFunds` when the
    /// balance cannot cover the amount
    pub async fn debit_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        owner: Uuid,
        currency_id: i32,
        amount: Amount,
    ) -> Result<Wallet> {
        let mut wallet = lock_or_create(tx, owner, currency_id).await?;
        if amount > wallet.balance {
            return Err(Error::InsufficientFunds(format!(
                "balance {} cannot cover debit of {} for owner {} in currency {}",
                wallet.balance, amount, owner, currency_id
            )));
        }
        wallet.balance -= amount;
        wallet.modified_at = Utc::now();
        write_balance(tx, &wallet).await?;
        Ok(wallet)
    }
}
