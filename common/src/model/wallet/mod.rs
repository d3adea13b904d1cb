//! Wallet model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Amount;

/// Per-(owner, currency) balance. Created lazily the first time an account
/// holds a currency. The balance never goes negative; debits that would do
/// so are rejected before any mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// Owning account
    pub owner: Uuid,
    /// Currency held
    pub currency_id: i32,
    /// Current balance, always >= 0
    pub balance: Amount,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub modified_at: DateTime<Utc>,
}

impl Wallet {
    /// Create a new empty wallet
    pub fn new(owner: Uuid, currency_id: i32) -> Self {
        let now = Utc::now();
        Self {
            owner,
            currency_id,
            balance: Amount::ZERO,
            created_at: now,
            modified_at: now,
        }
    }

    /// Add funds
    pub fn credit(&mut self, amount: Amount) {
        self.balance += amount;
        self.modified_at = Utc::now();
    }

    /// Remove funds; fails without mutating when the balance is too small
    pub fn debit(&mut self, amount: Amount) -> Result<(), String> {
        if amount > self.balance {
            return Err(format!(
                "balance {} cannot cover debit of {}",
                self.balance, amount
            ));
        }
        self.balance -= amount;
        self.modified_at = Utc::now();
        Ok(())
    }
}
