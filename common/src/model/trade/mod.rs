//! Trade model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::{Amount, Price, Quantity};
use crate::model::currency::AssetPair;

/// An immutable record of one match between exactly one buy order and one
/// sell order. Trades are append-only; the engine never updates or deletes
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Unique trade ID
    pub id: Uuid,
    /// The order book the trade occurred on
    pub pair: AssetPair,
    /// Buy-side order
    pub buy_order_id: Uuid,
    /// Sell-side order
    pub sell_order_id: Uuid,
    /// Buy-side owner
    pub buyer: Uuid,
    /// Sell-side owner
    pub seller: Uuid,
    /// Quantity exchanged
    pub filled_quantity: Quantity,
    /// Execution price: always the resting sell order's price
    pub price: Price,
    /// (buy.price - price) * filled_quantity, refunded to the buyer
    pub overpayment_amount: Amount,
    /// The logical trade moment (the batch's trade clock, not wall-clock)
    pub created_at: DateTime<Utc>,
    /// Equal to created_at; trades never change
    pub modified_at: DateTime<Utc>,
}

impl Trade {
    /// Secondary-currency value exchanged, excluding the overpayment refund
    pub fn secondary_amount(&self) -> Amount {
        self.price * self.filled_quantity
    }
}
