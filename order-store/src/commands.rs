//! Command objects and read models for store operations
//!
//! Mutations are expressed as explicit command values handed to the
//! repository, which applies each one as a single atomic unit. Side effects
//! are never hidden in a save path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::decimal::{Amount, Price, Quantity};
use common::model::currency::AssetPair;
use common::model::order::{Order, Side};

/// Reserve funds and create an order, atomically
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub owner: Uuid,
    pub pair_id: i32,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Price,
    /// Logical creation moment, already forward-adjusted past the trade
    /// clock by the lifecycle service
    pub created_at: DateTime<Utc>,
}

/// Settle one matched (sell, buy) pair as one trade.
///
/// Computed by the matching engine from its locked candidate snapshot; the
/// repository re-validates both orders under row locks before applying it.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub pair: AssetPair,
    pub sell_order_id: Uuid,
    pub buy_order_id: Uuid,
    pub seller: Uuid,
    pub buyer: Uuid,
    /// Quantity to exchange, min of both unfilled quantities at plan time
    pub fill_quantity: Quantity,
    /// Execution price: the resting sell order's price
    pub price: Price,
    /// (buy.price - price) * fill_quantity, refunded to the buyer
    pub overpayment_amount: Amount,
    /// The batch's trade clock; becomes the trade's created_at
    pub trade_at: DateTime<Utc>,
}

/// Read-only order book view for one pair: sells best-first (price
/// ascending), buys best-first (price descending), time/seq tie-broken.
/// Takes no locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: AssetPair,
    pub sells: Vec<Order>,
    pub buys: Vec<Order>,
    pub as_of: DateTime<Utc>,
}
