//! Order lifecycle operations
//!
//! The operations external callers invoke: submit (reserve funds), cancel
//! (refund the unfilled reservation), and the read models. Validation and
//! the trade-clock forward adjustment happen here; atomicity happens in the
//! repository.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::decimal::{Price, Quantity};
use common::error::{Error, Result};
use common::model::order::{Order, Side};
use common::model::trade::Trade;
use tracing::{debug, info};
use uuid::Uuid;

use crate::commands::{BookSnapshot, NewOrder};
use crate::repository::OrderRepository;

/// Order lifecycle service over a repository
pub struct OrderLifecycle {
    repo: Arc<dyn OrderRepository>,
}

impl OrderLifecycle {
    pub fn new(repo: Arc<dyn OrderRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> Arc<dyn OrderRepository> {
        self.repo.clone()
    }

    /// Submit a limit order: validate, reserve funds, persist.
    ///
    /// The creation timestamp is forward-adjusted past the engine's trade
    /// clock so a just-submitted order can never insert itself before a
    /// batch that has already started evaluating the book. The adjustment
    /// only ever moves time forward, and only while a trade clock exists.
    pub async fn submit(
        &self,
        owner: Uuid,
        pair_id: i32,
        side: Side,
        quantity: Quantity,
        price: Price,
    ) -> Result<Order> {
        if quantity <= Quantity::ZERO {
            return Err(Error::Validation(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }
        if price <= Price::ZERO {
            return Err(Error::Validation(format!(
                "price must be positive, got {}",
                price
            )));
        }

        let created_at = self.adjusted_creation_time(Utc::now()).await?;

        let order = self
            .repo
            .reserve_and_create(NewOrder {
                owner,
                pair_id,
                side,
                quantity,
                price,
                created_at,
            })
            .await?;

        info!(
            "Submitted {:?} order {} on pair {}: {} @ {}",
            side, order.id, pair_id, quantity, price
        );
        Ok(order)
    }

    /// Cancel an order, refunding the unfilled reservation synchronously
    pub async fn cancel(&self, owner: Uuid, order_id: Uuid) -> Result<Order> {
        let order = self
            .repo
            .order(order_id)
            .await?
            .ok_or_else(|| Error::OrderNotFound(format!("order {}", order_id)))?;

        if order.owner != owner {
            return Err(Error::NotOwner(format!(
                "order {} does not belong to {}",
                order_id, owner
            )));
        }

        self.repo.cancel_order(order_id, Utc::now()).await
    }

    /// Get an order by id
    pub async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        self.repo.order(id).await
    }

    /// All orders for an owner, newest first
    pub async fn orders_for(&self, owner: Uuid) -> Result<Vec<Order>> {
        self.repo.orders_for(owner).await
    }

    /// All trades an order participated in
    pub async fn trades_for_order(&self, order_id: Uuid) -> Result<Vec<Trade>> {
        self.repo.trades_for_order(order_id).await
    }

    /// Read-only book view for display; takes no locks
    pub async fn book_snapshot(&self, pair_id: i32) -> Result<BookSnapshot> {
        let pair = self
            .repo
            .pair(pair_id)
            .await?
            .ok_or_else(|| Error::PairNotFound(format!("pair {}", pair_id)))?;

        let orders = self.repo.book_orders(pair_id).await?;
        let (mut sells, mut buys): (Vec<Order>, Vec<Order>) =
            orders.into_iter().partition(|o| o.side == Side::Sell);

        sells.sort_by(|a, b| {
            a.price
                .cmp(&b.price)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        buys.sort_by(|a, b| {
            b.price
                .cmp(&a.price)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.seq.cmp(&b.seq))
        });

        Ok(BookSnapshot {
            pair,
            sells,
            buys,
            as_of: Utc::now(),
        })
    }

    async fn adjusted_creation_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self.repo.trade_clock().await? {
            Some(trade_at) if now <= trade_at => {
                let adjusted = trade_at + Duration::microseconds(1);
                debug!(
                    "Forward-adjusting order creation time from {} to {}",
                    now, adjusted
                );
                Ok(adjusted)
            }
            _ => Ok(now),
        }
    }
}
