//! Two-cursor pairing over the sorted candidate list
//!
//! Candidates arrive sorted by `order_store::repository::candidate_sort_key`:
//! the sell region reads in priority order from the head, the buy region
//! reads in priority order from the tail. The two cursors advance inward,
//! converging pair-by-pair, so one pass finds every match without
//! re-querying.

use common::decimal::Quantity;
use common::model::order::{Order, Side};
use tracing::trace;

/// Cursor positions into the combined candidate list. `sell` indexes from
/// the head; `buy` indexes from the tail (absolute index, moving downward).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    pub sell: usize,
    pub buy: usize,
}

impl Cursors {
    /// Cursors for a freshly fetched candidate list
    pub fn new(candidates: &[Order]) -> Self {
        Self {
            sell: 0,
            buy: candidates.len().saturating_sub(1),
        }
    }
}

/// A match the cursors found: indices of the sell and buy orders and the
/// quantity to fill (min of both unfilled quantities).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchFound {
    pub sell_idx: usize,
    pub buy_idx: usize,
    pub fill_quantity: Quantity,
}

fn pair_key(order: &Order) -> (i32, i32) {
    (
        order.pair.primary_currency_id,
        order.pair.secondary_currency_id,
    )
}

/// Advance the sell cursor past its current pair group
fn advance_sell_past_pair(candidates: &[Order], cursors: &mut Cursors) {
    let key = pair_key(&candidates[cursors.sell]);
    while cursors.sell < candidates.len()
        && candidates[cursors.sell].side == Side::Sell
        && pair_key(&candidates[cursors.sell]) == key
    {
        cursors.sell += 1;
    }
}

/// Advance the buy cursor (downward) past its current pair group. Returns
/// false when the buy side is exhausted.
fn advance_buy_past_pair(candidates: &[Order], cursors: &mut Cursors) -> bool {
    let key = pair_key(&candidates[cursors.buy]);
    loop {
        if candidates[cursors.buy].side != Side::Buy
            || pair_key(&candidates[cursors.buy]) != key
        {
            return true;
        }
        if cursors.buy == 0 {
            return false;
        }
        cursors.buy -= 1;
    }
}

/// Find the next match at or after the given cursors.
///
/// The caller settles the returned match, applies the fill to its snapshot,
/// and advances the cursor(s) whose order became Filled before calling
/// again. Returns None when either side is exhausted, the cursors cross, or
/// no remaining pair crosses.
pub fn next_match(candidates: &[Order], cursors: &mut Cursors) -> Option<MatchFound> {
    loop {
        if candidates.is_empty() || cursors.sell >= candidates.len() || cursors.sell > cursors.buy
        {
            return None;
        }

        let sell = &candidates[cursors.sell];
        let buy = &candidates[cursors.buy];

        // Crossing into the other side's region means that side is exhausted
        if sell.side != Side::Sell || buy.side != Side::Buy {
            return None;
        }

        let sell_pair = pair_key(sell);
        let buy_pair = pair_key(buy);

        if sell_pair != buy_pair {
            // Advance whichever cursor is behind to its next pair boundary.
            // Both walks visit pairs in ascending key order, so the smaller
            // key is the one with no counterpart left.
            if sell_pair < buy_pair {
                advance_sell_past_pair(candidates, cursors);
            } else if !advance_buy_past_pair(candidates, cursors) {
                return None;
            }
            continue;
        }

        if sell.price > buy.price {
            // Best sell and best buy of this pair no longer cross; nothing
            // further can match here
            trace!(
                "pair {:?} no longer crosses: sell {} > buy {}",
                sell_pair,
                sell.price,
                buy.price
            );
            advance_sell_past_pair(candidates, cursors);
            if !advance_buy_past_pair(candidates, cursors) {
                return None;
            }
            continue;
        }

        let fill_quantity = sell.unfilled_quantity().min(buy.unfilled_quantity());
        return Some(MatchFound {
            sell_idx: cursors.sell,
            buy_idx: cursors.buy,
            fill_quantity,
        });
    }
}
