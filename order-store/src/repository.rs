//! Repository for order, trade, and engine-lock data

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::decimal::{Amount, Quantity};
use common::error::{Error, Result};
use common::model::currency::{AssetPair, Currency};
use common::model::engine::{EngineLock, ENGINE_LOCK_ID};
use common::model::order::{Order, Side, Status};
use common::model::trade::Trade;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;
use wallet_ledger::repository::{pg as wallet_pg, InMemoryWalletRepository};

use crate::advisory::{AdvisoryLocks, LockClass};
use crate::commands::{NewOrder, Settlement};

/// Sort key for the combined candidate list.
///
/// The sell cursor walks the list forward from index 0; the buy cursor
/// walks backward from the tail. Sells sort in priority order directly:
/// pair ascending, price ascending (best sell first), time, seq. The buy
/// region must read in priority order *when traversed backward*, so its
/// index-ascending key is the exact reverse of that walk: pairs by negated
/// currency ids (reverse pair order), price ascending (the backward walk
/// then sees the highest buy first), time and seq negated (the backward
/// walk sees earlier orders first). A sign error here produces wrong
/// matches, not crashes; the pairing property tests pin this down.
pub fn candidate_sort_key(order: &Order) -> (i32, i64, i64, Decimal, i64, i64) {
    let side_rank = match order.side {
        Side::Sell => 0,
        Side::Buy => 1,
    };
    let flip = -i64::from(order.side.sign()); // sell -> +1, buy -> -1
    (
        side_rank,
        flip * i64::from(order.pair.primary_currency_id),
        flip * i64::from(order.pair.secondary_currency_id),
        order.price,
        flip * order.created_at.timestamp_micros(),
        flip * order.seq,
    )
}

/// Order repository trait.
///
/// Every mutation is a single atomic unit: `reserve_and_create` (debit +
/// insert), `cancel_order` (status flip + refund), `execute_settlement`
/// (fills + trade + credits). A failure anywhere inside one of them leaves
/// no partial state behind.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Register a currency
    async fn create_currency(&self, code: &str, name: &str) -> Result<Currency>;

    /// Register an asset pair
    async fn create_pair(&self, primary_currency_id: i32, secondary_currency_id: i32)
        -> Result<AssetPair>;

    /// Get an asset pair by id
    async fn pair(&self, id: i32) -> Result<Option<AssetPair>>;

    /// Debit the reservation and insert the order, atomically
    async fn reserve_and_create(&self, cmd: NewOrder) -> Result<Order>;

    /// Cancel an order and refund the unfilled reservation, atomically.
    /// Fails with `InvalidTransition` when the order is terminal.
    async fn cancel_order(&self, order_id: Uuid, at: DateTime<Utc>) -> Result<Order>;

    /// Get an order by id
    async fn order(&self, id: Uuid) -> Result<Option<Order>>;

    /// All orders for an owner, newest first
    async fn orders_for(&self, owner: Uuid) -> Result<Vec<Order>>;

    /// All trades an order participated in, oldest first
    async fn trades_for_order(&self, order_id: Uuid) -> Result<Vec<Trade>>;

    /// Active (Open/PartiallyFilled) orders on a pair, unsorted
    async fn book_orders(&self, pair_id: i32) -> Result<Vec<Order>>;

    /// The matching pass working set: active orders created at or before
    /// `trade_at` whose pair has at least one crossing opposite order,
    /// globally sorted by `candidate_sort_key`, each advisory-locked at
    /// fetch time. Orders another session has locked are skipped.
    async fn candidates(
        &self,
        trade_at: DateTime<Utc>,
        locks: &dyn AdvisoryLocks,
    ) -> Result<Vec<Order>>;

    /// Apply a settlement command in one transaction; both orders are
    /// re-read under row locks and re-validated before any mutation
    async fn execute_settlement(&self, cmd: Settlement) -> Result<Trade>;

    /// Read the engine lock row, if it exists
    async fn engine_lock(&self) -> Result<Option<EngineLock>>;

    /// Acquire the singleton engine lock. Fails with `EngineAlreadyRunning`
    /// when held and `force` is false; `force` steals it.
    async fn acquire_engine_lock(&self, at: DateTime<Utc>, force: bool) -> Result<()>;

    /// Release the engine lock (clears `acquired_at`, keeps `trade_at`)
    async fn release_engine_lock(&self) -> Result<()>;

    /// Stamp a new trade clock on the lock row without releasing it
    async fn stamp_trade_at(&self, at: DateTime<Utc>) -> Result<()>;

    /// Current trade clock, if a lock row with one exists
    async fn trade_clock(&self) -> Result<Option<DateTime<Utc>>>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemState {
    currencies: HashMap<i32, Currency>,
    pairs: HashMap<i32, AssetPair>,
    orders: HashMap<Uuid, Order>,
    trades: Vec<Trade>,
    engine_lock: Option<EngineLock>,
    next_currency_id: i32,
    next_pair_id: i32,
    next_seq: i64,
}

/// In-memory repository for order data.
///
/// A single async mutex over the whole state stands in for database
/// transactions: each trait method validates fully before mutating, so a
/// failed operation leaves no partial state.
pub struct InMemoryOrderRepository {
    state: tokio::sync::Mutex<MemState>,
    wallets: Arc<InMemoryWalletRepository>,
}

impl InMemoryOrderRepository {
    /// Create a repository sharing the given wallet store
    pub fn new(wallets: Arc<InMemoryWalletRepository>) -> Self {
        Self {
            state: tokio::sync::Mutex::new(MemState::default()),
            wallets,
        }
    }

    /// All trades, in settlement order; used by tests
    pub async fn all_trades(&self) -> Vec<Trade> {
        self.state.lock().await.trades.clone()
    }
}

fn crossing_pairs(orders: &[&Order]) -> Vec<i32> {
    let mut best: HashMap<i32, (Option<Decimal>, Option<Decimal>)> = HashMap::new();
    for order in orders {
        let entry = best.entry(order.pair.id).or_default();
        match order.side {
            Side::Sell => {
                entry.0 = Some(match entry.0 {
                    Some(b) => b.min(order.price),
                    None => order.price,
                })
            }
            Side::Buy => {
                entry.1 = Some(match entry.1 {
                    Some(b) => b.max(order.price),
                    None => order.price,
                })
            }
        }
    }
    best.into_iter()
        .filter_map(|(pair_id, (best_sell, best_buy))| match (best_sell, best_buy) {
            (Some(sell), Some(buy)) if sell <= buy => Some(pair_id),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create_currency(&self, code: &str, name: &str) -> Result<Currency> {
        let mut state = self.state.lock().await;
        if state.currencies.values().any(|c| c.code == code) {
            return Err(Error::Validation(format!("currency {} already exists", code)));
        }
        state.next_currency_id += 1;
        let currency = Currency {
            id: state.next_currency_id,
            code: code.to_string(),
            name: name.to_string(),
        };
        state.currencies.insert(currency.id, currency.clone());
        Ok(currency)
    }

    async fn create_pair(
        &self,
        primary_currency_id: i32,
        secondary_currency_id: i32,
    ) -> Result<AssetPair> {
        let mut state = self.state.lock().await;
        if !state.currencies.contains_key(&primary_currency_id)
            || !state.currencies.contains_key(&secondary_currency_id)
        {
            return Err(Error::CurrencyNotFound(format!(
                "pair references unknown currency ({}, {})",
                primary_currency_id, secondary_currency_id
            )));
        }
        if state.pairs.values().any(|p| {
            p.primary_currency_id == primary_currency_id
                && p.secondary_currency_id == secondary_currency_id
        }) {
            return Err(Error::Validation(format!(
                "pair ({}, {}) already exists",
                primary_currency_id, secondary_currency_id
            )));
        }
        state.next_pair_id += 1;
        let pair = AssetPair::new(state.next_pair_id, primary_currency_id, secondary_currency_id);
        state.pairs.insert(pair.id, pair);
        Ok(pair)
    }

    async fn pair(&self, id: i32) -> Result<Option<AssetPair>> {
        Ok(self.state.lock().await.pairs.get(&id).copied())
    }

    async fn reserve_and_create(&self, cmd: NewOrder) -> Result<Order> {
        let mut state = self.state.lock().await;
        let pair = *state
            .pairs
            .get(&cmd.pair_id)
            .ok_or_else(|| Error::PairNotFound(format!("pair {}", cmd.pair_id)))?;

        let (currency_id, amount) = match cmd.side {
            Side::Buy => (pair.secondary_currency_id, cmd.quantity * cmd.price),
            Side::Sell => (pair.primary_currency_id, cmd.quantity),
        };

        // Debit first: an insufficient balance must leave no order behind
        use wallet_ledger::repository::WalletRepository;
        self.wallets.debit(cmd.owner, currency_id, amount).await?;

        state.next_seq += 1;
        let order = Order {
            id: Uuid::new_v4(),
            seq: state.next_seq,
            owner: cmd.owner,
            pair,
            side: cmd.side,
            quantity: cmd.quantity,
            price: cmd.price,
            filled_quantity: Quantity::ZERO,
            status: Status::Open,
            created_at: cmd.created_at,
            modified_at: cmd.created_at,
        };
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: Uuid, at: DateTime<Utc>) -> Result<Order> {
        let mut state = self.state.lock().await;
        let mut order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| Error::OrderNotFound(format!("order {}", order_id)))?;

        order.apply_cancel(at)?;

        let refund = order.unfilled_reservation();
        if refund > Amount::ZERO {
            use wallet_ledger::repository::WalletRepository;
            self.wallets
                .credit(order.owner, order.reserved_currency_id(), refund)
                .await?;
        }

        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn orders_for(&self, owner: Uuid) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.owner == owner)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.seq.cmp(&a.seq)));
        Ok(orders)
    }

    async fn trades_for_order(&self, order_id: Uuid) -> Result<Vec<Trade>> {
        let state = self.state.lock().await;
        Ok(state
            .trades
            .iter()
            .filter(|t| t.buy_order_id == order_id || t.sell_order_id == order_id)
            .cloned()
            .collect())
    }

    async fn book_orders(&self, pair_id: i32) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.pair.id == pair_id && o.is_active())
            .cloned()
            .collect())
    }

    async fn candidates(
        &self,
        trade_at: DateTime<Utc>,
        locks: &dyn AdvisoryLocks,
    ) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        let active: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| o.is_active() && o.created_at <= trade_at)
            .collect();

        let pairs = crossing_pairs(&active);
        let mut matchable: Vec<Order> = active
            .into_iter()
            .filter(|o| pairs.contains(&o.pair.id))
            .cloned()
            .collect();
        matchable.sort_by(|a, b| candidate_sort_key(a).cmp(&candidate_sort_key(b)));

        let mut locked = Vec::with_capacity(matchable.len());
        for order in matchable {
            if locks.try_lock(LockClass::Order, order.seq).await? {
                locked.push(order);
            }
        }
        Ok(locked)
    }

    async fn execute_settlement(&self, cmd: Settlement) -> Result<Trade> {
        let mut state = self.state.lock().await;

        let mut sell = state
            .orders
            .get(&cmd.sell_order_id)
            .cloned()
            .ok_or_else(|| Error::OrderNotFound(format!("sell order {}", cmd.sell_order_id)))?;
        let mut buy = state
            .orders
            .get(&cmd.buy_order_id)
            .cloned()
            .ok_or_else(|| Error::OrderNotFound(format!("buy order {}", cmd.buy_order_id)))?;

        // Validate both fills before touching anything
        sell.apply_fill(cmd.fill_quantity, cmd.trade_at)?;
        buy.apply_fill(cmd.fill_quantity, cmd.trade_at)?;

        let trade = Trade {
            id: Uuid::new_v4(),
            pair: cmd.pair,
            buy_order_id: buy.id,
            sell_order_id: sell.id,
            buyer: cmd.buyer,
            seller: cmd.seller,
            filled_quantity: cmd.fill_quantity,
            price: cmd.price,
            overpayment_amount: cmd.overpayment_amount,
            created_at: cmd.trade_at,
            modified_at: cmd.trade_at,
        };

        use wallet_ledger::repository::WalletRepository;
        self.wallets
            .credit(cmd.buyer, cmd.pair.primary_currency_id, cmd.fill_quantity)
            .await?;
        if cmd.overpayment_amount > Amount::ZERO {
            self.wallets
                .credit(cmd.buyer, cmd.pair.secondary_currency_id, cmd.overpayment_amount)
                .await?;
        }
        self.wallets
            .credit(
                cmd.seller,
                cmd.pair.secondary_currency_id,
                cmd.price * cmd.fill_quantity,
            )
            .await?;

        state.orders.insert(sell.id, sell);
        state.orders.insert(buy.id, buy);
        state.trades.push(trade.clone());
        Ok(trade)
    }

    async fn engine_lock(&self) -> Result<Option<EngineLock>> {
        Ok(self.state.lock().await.engine_lock.clone())
    }

    async fn acquire_engine_lock(&self, at: DateTime<Utc>, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let existing = state.engine_lock.clone();
        match existing {
            Some(lock) if lock.is_held() && !force => Err(Error::EngineAlreadyRunning(format!(
                "engine lock held since {:?}",
                lock.acquired_at
            ))),
            Some(lock) => {
                state.engine_lock = Some(EngineLock {
                    acquired_at: Some(at),
                    trade_at: lock.trade_at,
                });
                Ok(())
            }
            None => {
                state.engine_lock = Some(EngineLock {
                    acquired_at: Some(at),
                    trade_at: None,
                });
                Ok(())
            }
        }
    }

    async fn release_engine_lock(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(lock) = &mut state.engine_lock {
            lock.acquired_at = None;
        }
        Ok(())
    }

    async fn stamp_trade_at(&self, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        match &mut state.engine_lock {
            Some(lock) => {
                lock.trade_at = Some(at);
                Ok(())
            }
            None => Err(Error::Internal(
                "stamping trade clock without an engine lock row".to_string(),
            )),
        }
    }

    async fn trade_clock(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .await
            .engine_lock
            .as_ref()
            .and_then(|l| l.trade_at))
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL implementation
// ---------------------------------------------------------------------------

/// PostgreSQL repository for order data
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_to_str(status: Status) -> &'static str {
    match status {
        Status::Open => "open",
        Status::PartiallyFilled => "partially_filled",
        Status::Filled => "filled",
        Status::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> Result<Status> {
    match s {
        "open" => Ok(Status::Open),
        "partially_filled" => Ok(Status::PartiallyFilled),
        "filled" => Ok(Status::Filled),
        "cancelled" => Ok(Status::Cancelled),
        other => Err(Error::Internal(format!("unknown order status: {}", other))),
    }
}

fn parse_decimal(value: String, field: &str) -> Result<Decimal> {
    value
        .parse::<Decimal>()
        .map_err(|e| Error::Internal(format!("Invalid {} format: {}", field, e)))
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let side: i16 = row.get("side");
    let side = match side {
        1 => Side::Buy,
        -1 => Side::Sell,
        other => return Err(Error::Internal(format!("unknown order side: {}", other))),
    };
    let status: String = row.get("status");

    Ok(Order {
        id: row.get("id"),
        seq: row.get("seq"),
        owner: row.get("owner"),
        pair: AssetPair {
            id: row.get("pair_id"),
            primary_currency_id: row.get("primary_currency_id"),
            secondary_currency_id: row.get("secondary_currency_id"),
        },
        side,
        quantity: parse_decimal(row.get("quantity"), "quantity")?,
        price: parse_decimal(row.get("price"), "price")?,
        filled_quantity: parse_decimal(row.get("filled_quantity"), "filled_quantity")?,
        status: status_from_str(&status)?,
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn trade_from_row(row: &PgRow) -> Result<Trade> {
    Ok(Trade {
        id: row.get("id"),
        pair: AssetPair {
            id: row.get("pair_id"),
            primary_currency_id: row.get("primary_currency_id"),
            secondary_currency_id: row.get("secondary_currency_id"),
        },
        buy_order_id: row.get("buy_order_id"),
        sell_order_id: row.get("sell_order_id"),
        buyer: row.get("buyer"),
        seller: row.get("seller"),
        filled_quantity: parse_decimal(row.get("filled_quantity"), "filled_quantity")?,
        price: parse_decimal(row.get("price"), "price")?,
        overpayment_amount: parse_decimal(row.get("overpayment_amount"), "overpayment_amount")?,
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

const ORDER_COLUMNS: &str = "o.id, o.seq, o.owner, o.pair_id, \
     p.primary_currency_id, p.secondary_currency_id, o.side, \
     o.quantity::text AS quantity, o.price::text AS price, \
     o.filled_quantity::text AS filled_quantity, o.status, \
     o.created_at, o.modified_at";

const TRADE_COLUMNS: &str = "t.id, t.pair_id, \
     p.primary_currency_id, p.secondary_currency_id, \
     t.buy_order_id, t.sell_order_id, t.buyer, t.seller, \
     t.filled_quantity::text AS filled_quantity, t.price::text AS price, \
     t.overpayment_amount::text AS overpayment_amount, \
     t.created_at, t.modified_at";

impl PostgresOrderRepository {
    async fn order_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order_id: Uuid,
    ) -> Result<Order> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM orders o
             JOIN asset_pairs p ON p.id = o.pair_id
             WHERE o.id = $1
             FOR UPDATE OF o",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::OrderNotFound(format!("order {}", order_id)))?;

        order_from_row(&row)
    }

    async fn write_order_fill(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &Order,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders
             SET filled_quantity = $2::numeric, status = $3, modified_at = $4
             WHERE id = $1",
        )
        .bind(order.id)
        .bind(order.filled_quantity.to_string())
        .bind(status_to_str(order.status))
        .bind(order.modified_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn create_currency(&self, code: &str, name: &str) -> Result<Currency> {
        let row = sqlx::query(
            "INSERT INTO currencies (code, name) VALUES ($1, $2)
             RETURNING id, code, name",
        )
        .bind(code)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(Currency {
            id: row.get("id"),
            code: row.get("code"),
            name: row.get("name"),
        })
    }

    async fn create_pair(
        &self,
        primary_currency_id: i32,
        secondary_currency_id: i32,
    ) -> Result<AssetPair> {
        let row = sqlx::query(
            "INSERT INTO asset_pairs (primary_currency_id, secondary_currency_id)
             VALUES ($1, $2)
             RETURNING id, primary_currency_id, secondary_currency_id",
        )
        .bind(primary_currency_id)
        .bind(secondary_currency_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(AssetPair {
            id: row.get("id"),
            primary_currency_id: row.get("primary_currency_id"),
            secondary_currency_id: row.get("secondary_currency_id"),
        })
    }

    async fn pair(&self, id: i32) -> Result<Option<AssetPair>> {
        let row = sqlx::query(
            "SELECT id, primary_currency_id, secondary_currency_id
             FROM asset_pairs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AssetPair {
            id: row.get("id"),
            primary_currency_id: row.get("primary_currency_id"),
            secondary_currency_id: row.get("secondary_currency_id"),
        }))
    }

    async fn reserve_and_create(&self, cmd: NewOrder) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let pair = sqlx::query(
            "SELECT id, primary_currency_id, secondary_currency_id
             FROM asset_pairs WHERE id = $1",
        )
        .bind(cmd.pair_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::PairNotFound(format!("pair {}", cmd.pair_id)))?;
        let pair = AssetPair {
            id: pair.get("id"),
            primary_currency_id: pair.get("primary_currency_id"),
            secondary_currency_id: pair.get("secondary_currency_id"),
        };

        let (currency_id, amount) = match cmd.side {
            Side::Buy => (pair.secondary_currency_id, cmd.quantity * cmd.price),
            Side::Sell => (pair.primary_currency_id, cmd.quantity),
        };

        // Reservation and insert commit or fail together
        wallet_pg::debit_in_tx(&mut tx, cmd.owner, currency_id, amount).await?;

        let id = Uuid::new_v4();
        let row = sqlx::query(
            "INSERT INTO orders
                 (id, owner, pair_id, side, quantity, price, filled_quantity,
                  status, created_at, modified_at)
             VALUES ($1, $2, $3, $4, $5::numeric, $6::numeric, '0', 'open', $7, $7)
             RETURNING seq",
        )
        .bind(id)
        .bind(cmd.owner)
        .bind(cmd.pair_id)
        .bind(cmd.side.sign() as i16)
        .bind(cmd.quantity.to_string())
        .bind(cmd.price.to_string())
        .bind(cmd.created_at)
        .fetch_one(&mut *tx)
        .await?;
        let seq: i64 = row.get("seq");

        tx.commit().await?;

        debug!("Created order {} (seq {})", id, seq);
        Ok(Order {
            id,
            seq,
            owner: cmd.owner,
            pair,
            side: cmd.side,
            quantity: cmd.quantity,
            price: cmd.price,
            filled_quantity: Quantity::ZERO,
            status: Status::Open,
            created_at: cmd.created_at,
            modified_at: cmd.created_at,
        })
    }

    async fn cancel_order(&self, order_id: Uuid, at: DateTime<Utc>) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let mut order = Self::order_for_update(&mut tx, order_id).await?;
        order.apply_cancel(at)?;

        sqlx::query("UPDATE orders SET status = 'cancelled', modified_at = $2 WHERE id = $1")
            .bind(order.id)
            .bind(at)
            .execute(&mut *tx)
            .await?;

        let refund = order.unfilled_reservation();
        if refund > Amount::ZERO {
            wallet_pg::credit_in_tx(&mut tx, order.owner, order.reserved_currency_id(), refund)
                .await?;
        }

        tx.commit().await?;
        info!("Cancelled order {}, refunded {}", order.id, refund);
        Ok(order)
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM orders o
             JOIN asset_pairs p ON p.id = o.pair_id
             WHERE o.id = $1",
            ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| order_from_row(&row)).transpose()
    }

    async fn orders_for(&self, owner: Uuid) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders o
             JOIN asset_pairs p ON p.id = o.pair_id
             WHERE o.owner = $1
             ORDER BY o.created_at DESC, o.seq DESC",
            ORDER_COLUMNS
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn trades_for_order(&self, order_id: Uuid) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades t
             JOIN asset_pairs p ON p.id = t.pair_id
             WHERE t.buy_order_id = $1 OR t.sell_order_id = $1
             ORDER BY t.created_at, t.id",
            TRADE_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn book_orders(&self, pair_id: i32) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders o
             JOIN asset_pairs p ON p.id = o.pair_id
             WHERE o.pair_id = $1 AND o.status IN ('open', 'partially_filled')",
            ORDER_COLUMNS
        ))
        .bind(pair_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn candidates(
        &self,
        trade_at: DateTime<Utc>,
        locks: &dyn AdvisoryLocks,
    ) -> Result<Vec<Order>> {
        // Single query per pass: active orders up to the trade clock, in
        // pairs where the best sell crosses the best buy, in cursor order.
        // The ORDER BY mirrors candidate_sort_key: buy-side pair ids, time
        // and seq are negated so the backward walk reads priority order.
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders o
             JOIN asset_pairs p ON p.id = o.pair_id
             JOIN (
                 SELECT pair_id
                 FROM orders
                 WHERE status IN ('open', 'partially_filled') AND created_at <= $1
                 GROUP BY pair_id
                 HAVING MIN(price) FILTER (WHERE side = -1)
                        <= MAX(price) FILTER (WHERE side = 1)
             ) m ON m.pair_id = o.pair_id
             WHERE o.status IN ('open', 'partially_filled') AND o.created_at <= $1
             ORDER BY o.side,
                      (-o.side) * p.primary_currency_id,
                      (-o.side) * p.secondary_currency_id,
                      o.price,
                      (-o.side) * EXTRACT(EPOCH FROM o.created_at),
                      (-o.side) * o.seq",
            ORDER_COLUMNS
        ))
        .bind(trade_at)
        .fetch_all(&self.pool)
        .await?;

        let mut locked = Vec::with_capacity(rows.len());
        for row in &rows {
            let order = order_from_row(row)?;
            if locks.try_lock(LockClass::Order, order.seq).await? {
                locked.push(order);
            }
        }
        Ok(locked)
    }

    async fn execute_settlement(&self, cmd: Settlement) -> Result<Trade> {
        let mut tx = self.pool.begin().await?;

        // Row-lock only the two orders actually being traded
        let mut sell = Self::order_for_update(&mut tx, cmd.sell_order_id).await?;
        let mut buy = Self::order_for_update(&mut tx, cmd.buy_order_id).await?;

        // Re-validate against current state; a concurrent cancel aborts here
        sell.apply_fill(cmd.fill_quantity, cmd.trade_at)?;
        buy.apply_fill(cmd.fill_quantity, cmd.trade_at)?;

        let trade_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO trades
                 (id, pair_id, buy_order_id, sell_order_id, buyer, seller,
                  filled_quantity, price, overpayment_amount, created_at, modified_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7::numeric, $8::numeric, $9::numeric, $10, $10)",
        )
        .bind(trade_id)
        .bind(cmd.pair.id)
        .bind(buy.id)
        .bind(sell.id)
        .bind(cmd.buyer)
        .bind(cmd.seller)
        .bind(cmd.fill_quantity.to_string())
        .bind(cmd.price.to_string())
        .bind(cmd.overpayment_amount.to_string())
        .bind(cmd.trade_at)
        .execute(&mut *tx)
        .await?;

        Self::write_order_fill(&mut tx, &sell).await?;
        Self::write_order_fill(&mut tx, &buy).await?;

        wallet_pg::credit_in_tx(&mut tx, cmd.buyer, cmd.pair.primary_currency_id, cmd.fill_quantity)
            .await?;
        if cmd.overpayment_amount > Amount::ZERO {
            wallet_pg::credit_in_tx(
                &mut tx,
                cmd.buyer,
                cmd.pair.secondary_currency_id,
                cmd.overpayment_amount,
            )
            .await?;
        }
        wallet_pg::credit_in_tx(
            &mut tx,
            cmd.seller,
            cmd.pair.secondary_currency_id,
            cmd.price * cmd.fill_quantity,
        )
        .await?;

        tx.commit().await?;

        Ok(Trade {
            id: trade_id,
            pair: cmd.pair,
            buy_order_id: buy.id,
            sell_order_id: sell.id,
            buyer: cmd.buyer,
            seller: cmd.seller,
            filled_quantity: cmd.fill_quantity,
            price: cmd.price,
            overpayment_amount: cmd.overpayment_amount,
            created_at: cmd.trade_at,
            modified_at: cmd.trade_at,
        })
    }

    async fn engine_lock(&self) -> Result<Option<EngineLock>> {
        let row = sqlx::query("SELECT acquired_at, trade_at FROM engine_lock WHERE id = $1")
            .bind(ENGINE_LOCK_ID)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| EngineLock {
            acquired_at: row.get("acquired_at"),
            trade_at: row.get("trade_at"),
        }))
    }

    async fn acquire_engine_lock(&self, at: DateTime<Utc>, force: bool) -> Result<()> {
        let result = if force {
            sqlx::query(
                "INSERT INTO engine_lock (id, acquired_at, trade_at)
                 VALUES ($1, $2, NULL)
                 ON CONFLICT (id) DO UPDATE SET acquired_at = EXCLUDED.acquired_at",
            )
            .bind(ENGINE_LOCK_ID)
            .bind(at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "INSERT INTO engine_lock (id, acquired_at, trade_at)
                 VALUES ($1, $2, NULL)
                 ON CONFLICT (id) DO UPDATE SET acquired_at = EXCLUDED.acquired_at
                 WHERE engine_lock.acquired_at IS NULL",
            )
            .bind(ENGINE_LOCK_ID)
            .bind(at)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(Error::EngineAlreadyRunning(
                "engine lock is held by another instance (use force to steal it)".to_string(),
            ));
        }
        Ok(())
    }

    async fn release_engine_lock(&self) -> Result<()> {
        sqlx::query("UPDATE engine_lock SET acquired_at = NULL WHERE id = $1")
            .bind(ENGINE_LOCK_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stamp_trade_at(&self, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE engine_lock SET trade_at = $2 WHERE id = $1")
            .bind(ENGINE_LOCK_ID)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Internal(
                "stamping trade clock without an engine lock row".to_string(),
            ));
        }
        Ok(())
    }

    async fn trade_clock(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT trade_at FROM engine_lock WHERE id = $1")
            .bind(ENGINE_LOCK_ID)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|row| row.get("trade_at")))
    }
}
