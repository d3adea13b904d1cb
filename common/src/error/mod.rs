//! Error types for the exchange engine
//!
//! This module provides a unified error handling system for all crates in
//! the exchange. It defines standard error types that can be used across
//! service boundaries and provides consistent error conversion.

use thiserror::Error;

/// Exchange engine error type
#[derive(Debug, Error)]
pub enum Error {
    /// Bad order parameters (quantity, price, pair)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A debit would overdraw the wallet
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// An order status change that the state machine forbids
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The caller does not own the order it is acting on
    #[error("Not owner: {0}")]
    NotOwner(String),

    /// Error when an order cannot be found
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Error when an asset pair cannot be found
    #[error("Asset pair not found: {0}")]
    PairNotFound(String),

    /// Error when a currency cannot be found
    #[error("Currency not found: {0}")]
    CurrencyNotFound(String),

    /// Error when a wallet cannot be found
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// A second processing loop tried to start while the engine lock is held
    #[error("Engine already running: {0}")]
    EngineAlreadyRunning(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decimal conversion error
    #[error("Decimal conversion error: {0}")]
    Decimal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should surface to an API caller as a client error
    /// rather than a server fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::InsufficientFunds(_)
                | Error::InvalidTransition(_)
                | Error::NotOwner(_)
                | Error::OrderNotFound(_)
                | Error::PairNotFound(_)
                | Error::CurrencyNotFound(_)
                | Error::WalletNotFound(_)
        )
    }
}

/// Convert string messages into an error
impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Internal(message)
    }
}

/// Convert static string references into an error
impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Internal(message.to_string())
    }
}

/// From rust_decimal::Error
impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::Decimal(err.to_string())
    }
}
