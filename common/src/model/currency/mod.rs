//! Currency and asset pair models

use serde::{Deserialize, Serialize};

/// A currency known to the exchange (e.g. "BTC", "USD")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    /// Numeric currency id; also feeds the candidate sort key
    pub id: i32,
    /// Short unique code (e.g. "BTC")
    pub code: String,
    /// Display name
    pub name: String,
}

/// One order book: a fixed-direction pair of currencies.
///
/// Orders on the pair buy or sell the primary currency, priced in the
/// secondary currency. Unique per (primary, secondary) and immutable once
/// referenced by orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPair {
    /// Pair id
    pub id: i32,
    /// Currency being bought/sold
    pub primary_currency_id: i32,
    /// Currency prices are quoted in
    pub secondary_currency_id: i32,
}

impl AssetPair {
    pub fn new(id: i32, primary_currency_id: i32, secondary_currency_id: i32) -> Self {
        Self {
            id,
            primary_currency_id,
            secondary_currency_id,
        }
    }
}
