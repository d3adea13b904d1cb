//! HTTP surface for the order lifecycle
//!
//! A thin axum layer over the lifecycle service and wallet ledger: submit,
//! cancel, read models, and an operator deposit endpoint. Correctness lives
//! below; this crate only validates shape, maps errors to status codes, and
//! publishes the best-effort wake signal after submissions.

pub mod api;
pub mod config;
pub mod error;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use matching_engine::WakeChannel;
use order_store::OrderLifecycle;
use wallet_ledger::LedgerService;

pub use config::ApiConfig;

/// App state shared across handlers
pub struct AppState {
    /// Order lifecycle operations
    pub lifecycle: Arc<OrderLifecycle>,
    /// Wallet ledger
    pub ledger: Arc<LedgerService>,
    /// Wake channel notified after each successful submission
    pub wake: Arc<dyn WakeChannel>,
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Order routes
        .route("/orders", post(api::orders::submit_order))
        .route("/orders/:id", get(api::orders::get_order))
        .route("/orders/:id/cancel", post(api::orders::cancel_order))
        .route("/orders/:id/trades", get(api::orders::get_order_trades))
        .route("/accounts/:owner/orders", get(api::orders::get_orders))
        // Wallet routes
        .route("/accounts/:owner/wallets", get(api::wallets::get_wallets))
        .route("/accounts/:owner/deposit", post(api::wallets::deposit))
        // Book snapshot
        .route("/pairs/:pair/book", get(api::orders::get_book));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
