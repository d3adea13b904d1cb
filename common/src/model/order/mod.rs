//! Order model and its lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::{Amount, Price, Quantity};
use crate::error::{Error, Result};
use crate::model::currency::AssetPair;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Numeric sign: Buy = +1, Sell = -1
    pub fn sign(&self) -> i32 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order status
///
/// Transitions: `Open -> PartiallyFilled -> Filled` as fills accumulate, and
/// `Open | PartiallyFilled -> Cancelled`. `Filled` and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Resting, no fills yet
    Open,
    /// Some quantity filled, remainder still resting
    PartiallyFilled,
    /// Fully filled; terminal
    Filled,
    /// Cancelled by the owner; terminal
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Filled | Status::Cancelled)
    }
}

/// A resting intent to buy or sell `quantity` units of the pair's primary
/// currency at `price` units of secondary currency per unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Unique order ID
    pub id: Uuid,
    /// Store-assigned monotone sequence; advisory-lock key and final
    /// price/time-priority tie-break
    pub seq: i64,
    /// Owning account
    pub owner: Uuid,
    /// The order book this order rests on
    pub pair: AssetPair,
    /// Buy or sell
    pub side: Side,
    /// Total quantity of primary currency
    pub quantity: Quantity,
    /// Limit price in secondary currency per unit
    pub price: Price,
    /// Cumulative filled quantity, 0..=quantity
    pub filled_quantity: Quantity,
    /// Current status
    pub status: Status,
    /// Creation timestamp (may be forward-adjusted past the trade clock)
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub modified_at: DateTime<Utc>,
}

impl Order {
    /// Quantity not yet filled
    pub fn unfilled_quantity(&self) -> Quantity {
        self.quantity - self.filled_quantity
    }

    /// Whether the order can still participate in matching
    pub fn is_active(&self) -> bool {
        matches!(self.status, Status::Open | Status::PartiallyFilled)
    }

    /// The currency this order's reservation is held in: a buy consumes
    /// secondary currency, a sell consumes primary currency.
    pub fn reserved_currency_id(&self) -> i32 {
        match self.side {
            Side::Buy => self.pair.secondary_currency_id,
            Side::Sell => self.pair.primary_currency_id,
        }
    }

    /// The amount debited from the owner's wallet at creation
    pub fn reservation_amount(&self) -> Amount {
        match self.side {
            Side::Buy => self.quantity * self.price,
            Side::Sell => self.quantity,
        }
    }

    /// The still-reserved amount refunded on cancellation
    pub fn unfilled_reservation(&self) -> Amount {
        match self.side {
            Side::Buy => self.unfilled_quantity() * self.price,
            Side::Sell => self.unfilled_quantity(),
        }
    }

    /// Record a fill of `fill_quantity` at `at`, advancing the status
    /// machine. Rejects fills on terminal orders and fills that would push
    /// `filled_quantity` past `quantity`.
    pub fn apply_fill(&mut self, fill_quantity: Quantity, at: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "cannot fill order {} in terminal status {:?}",
                self.id, self.status
            )));
        }
        if fill_quantity <= Quantity::ZERO || fill_quantity > self.unfilled_quantity() {
            return Err(Error::InvalidTransition(format!(
                "fill of {} outside (0, {}] for order {}",
                fill_quantity,
                self.unfilled_quantity(),
                self.id
            )));
        }

        self.filled_quantity += fill_quantity;
        self.status = if self.unfilled_quantity().is_zero() {
            Status::Filled
        } else {
            Status::PartiallyFilled
        };
        self.modified_at = at;
        Ok(())
    }

    /// Flip to Cancelled. Only Open and PartiallyFilled orders may cancel.
    pub fn apply_cancel(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "cannot cancel order {} in terminal status {:?}",
                self.id, self.status
            )));
        }
        self.status = Status::Cancelled;
        self.modified_at = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::dec;

    fn order(side: Side, quantity: Quantity, price: Price) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            seq: 1,
            owner: Uuid::new_v4(),
            pair: AssetPair::new(1, 10, 20),
            side,
            quantity,
            price,
            filled_quantity: Quantity::ZERO,
            status: Status::Open,
            created_at: now,
            modified_at: now,
        }
    }

    #[test]
    fn fill_progresses_to_partially_filled_then_filled() {
        let mut o = order(Side::Sell, dec!(10), dec!(8));
        o.apply_fill(dec!(3), Utc::now()).unwrap();
        assert_eq!(o.status, Status::PartiallyFilled);
        assert_eq!(o.unfilled_quantity(), dec!(7));

        o.apply_fill(dec!(7), Utc::now()).unwrap();
        assert_eq!(o.status, Status::Filled);
        assert!(o.unfilled_quantity().is_zero());
    }

    #[test]
    fn overfill_is_rejected() {
        let mut o = order(Side::Buy, dec!(2), dec!(100));
        assert!(o.apply_fill(dec!(3), Utc::now()).is_err());
        assert_eq!(o.status, Status::Open);
        assert_eq!(o.filled_quantity, Quantity::ZERO);
    }

    #[test]
    fn terminal_orders_reject_all_transitions() {
        let mut o = order(Side::Buy, dec!(2), dec!(100));
        o.apply_fill(dec!(2), Utc::now()).unwrap();
        assert_eq!(o.status, Status::Filled);
        assert!(o.apply_fill(dec!(1), Utc::now()).is_err());
        assert!(o.apply_cancel(Utc::now()).is_err());

        let mut c = order(Side::Sell, dec!(2), dec!(100));
        c.apply_cancel(Utc::now()).unwrap();
        assert!(c.apply_cancel(Utc::now()).is_err());
        assert!(c.apply_fill(dec!(1), Utc::now()).is_err());
    }

    #[test]
    fn reservation_depends_on_side() {
        let b = order(Side::Buy, dec!(5), dec!(101));
        assert_eq!(b.reservation_amount(), dec!(505));
        assert_eq!(b.reserved_currency_id(), 20);

        let s = order(Side::Sell, dec!(5), dec!(101));
        assert_eq!(s.reservation_amount(), dec!(5));
        assert_eq!(s.reserved_currency_id(), 10);
    }

    #[test]
    fn unfilled_reservation_shrinks_with_fills() {
        let mut b = order(Side::Buy, dec!(5), dec!(101));
        b.apply_fill(dec!(2), Utc::now()).unwrap();
        assert_eq!(b.unfilled_reservation(), dec!(303));
    }
}
