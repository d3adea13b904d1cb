//! Trade planning
//!
//! Turns a matched (sell, buy) pair into an explicit settlement command.
//! The store applies the command atomically: fills on both orders, the
//! trade row, and the three wallet credits commit or fail together.

use chrono::{DateTime, Utc};
use common::decimal::Amount;
use common::model::order::Order;
use order_store::Settlement;

/// Plan one trade between a matched sell and buy order.
///
/// The execution price is the resting sell order's price; the buyer's price
/// improvement is refunded as `overpayment_amount`. The pairing algorithm
/// guarantees `buy.price >= sell.price` and same-pair orders, so those are
/// debug assertions rather than runtime checks.
pub fn plan_trade(sell: &Order, buy: &Order, trade_at: DateTime<Utc>) -> Settlement {
    debug_assert_eq!(sell.pair.id, buy.pair.id);
    debug_assert!(buy.price >= sell.price);

    let price = sell.price;
    let fill_quantity = sell.unfilled_quantity().min(buy.unfilled_quantity());
    let overpayment_amount = (buy.price - price) * fill_quantity;

    Settlement {
        pair: sell.pair,
        sell_order_id: sell.id,
        buy_order_id: buy.id,
        seller: sell.owner,
        buyer: buy.owner,
        fill_quantity,
        price,
        overpayment_amount,
        trade_at,
    }
}

/// Conservation check used by tests: the secondary currency leaving the
/// buyer's reservation equals what the seller receives plus the refund.
pub fn settles_exactly(settlement: &Settlement, buy_price: common::decimal::Price) -> bool {
    let reserved_consumed = buy_price * settlement.fill_quantity;
    let paid_out = settlement.price * settlement.fill_quantity + settlement.overpayment_amount;
    reserved_consumed == paid_out && settlement.overpayment_amount >= Amount::ZERO
}
