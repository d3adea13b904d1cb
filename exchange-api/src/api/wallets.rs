//! Wallet API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use common::decimal::Amount;
use common::model::wallet::Wallet;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::response::{ApiListResponse, ApiResponse};
use crate::error::ApiError;
use crate::AppState;

/// Get all wallets for an account
pub async fn get_wallets(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<Uuid>,
) -> Result<ApiListResponse<Wallet>, ApiError> {
    let wallets = state.ledger.balances(owner).await?;
    Ok(ApiListResponse::new(wallets))
}

/// Deposit request (operator funding)
#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub currency_id: i32,
    pub amount: Amount,
}

/// Deposit funds into an account wallet
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<Uuid>,
    Json(request): Json<DepositRequest>,
) -> Result<ApiResponse<Wallet>, ApiError> {
    let wallet = state
        .ledger
        .deposit(owner, request.currency_id, request.amount)
        .await?;
    Ok(ApiResponse::new(wallet))
}
