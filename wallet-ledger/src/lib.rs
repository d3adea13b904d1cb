//! Wallet ledger: per-(owner, currency) balances with guarded mutation
//!
//! Every balance change in the exchange flows through this crate's guarded
//! credit/debit operations: order reservation, cancellation refunds, and
//! trade settlement credits. Debits that would overdraw a wallet are
//! rejected with no partial mutation.

pub mod config;
pub mod events;
pub mod repository;
pub mod service;

pub use config::LedgerConfig;
pub use events::{WalletEvent, WalletEvents};
pub use repository::{InMemoryWalletRepository, PostgresWalletRepository, WalletRepository};
pub use service::LedgerService;
