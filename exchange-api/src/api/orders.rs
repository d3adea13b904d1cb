//! Order API handlers
//!
//! Handlers for order lifecycle endpoints:
//! - Submit new limit orders (reserves funds, wakes the engine)
//! - Cancel resting orders (refund visible in the response)
//! - Read orders, their trades, and the book snapshot

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use common::decimal::{Price, Quantity};
use common::model::order::{Order, Side};
use common::model::trade::Trade;
use order_store::BookSnapshot;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::response::{ApiListResponse, ApiResponse};
use crate::error::ApiError;
use crate::AppState;

/// Submit order request
#[derive(Debug, Deserialize)]
pub struct SubmitOrderRequest {
    /// Owning account
    pub owner: Uuid,
    /// Asset pair (order book)
    pub pair_id: i32,
    /// Buy or sell
    pub side: Side,
    /// Quantity of primary currency
    pub quantity: Quantity,
    /// Limit price in secondary currency
    pub price: Price,
}

/// Cancel request; the owner must match the order's owner
#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub owner: Uuid,
}

/// Submit a new limit order
pub async fn submit_order(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitOrderRequest>,
) -> Result<ApiResponse<Order>, ApiError> {
    let order = state
        .lifecycle
        .submit(
            request.owner,
            request.pair_id,
            request.side,
            request.quantity,
            request.price,
        )
        .await?;

    // Best-effort wake: the engine self-polls, so a lost message only
    // delays matching until the next timeout
    let _ = state.wake.notify().await;

    Ok(ApiResponse::new(order))
}

/// Cancel an order; the refund is applied before this returns
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelOrderRequest>,
) -> Result<ApiResponse<Order>, ApiError> {
    tracing::info!("Cancelling order {} for {}", id, request.owner);
    let order = state.lifecycle.cancel(request.owner, id).await?;
    Ok(ApiResponse::new(order))
}

/// Get an order by ID
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<Order>, ApiError> {
    let order = state
        .lifecycle
        .order(id)
        .await?
        .ok_or_else(|| common::error::Error::OrderNotFound(format!("order {}", id)))?;
    Ok(ApiResponse::new(order))
}

/// Get the trades an order participated in
pub async fn get_order_trades(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<ApiListResponse<Trade>, ApiError> {
    let trades = state.lifecycle.trades_for_order(id).await?;
    Ok(ApiListResponse::new(trades))
}

/// Get all orders for an account
pub async fn get_orders(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<Uuid>,
) -> Result<ApiListResponse<Order>, ApiError> {
    let orders = state.lifecycle.orders_for(owner).await?;
    Ok(ApiListResponse::new(orders))
}

/// Get a read-only book snapshot for a pair
pub async fn get_book(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<i32>,
) -> Result<ApiResponse<BookSnapshot>, ApiError> {
    let snapshot = state.lifecycle.book_snapshot(pair).await?;
    Ok(ApiResponse::new(snapshot))
}
