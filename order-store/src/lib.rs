//! Order store: orders, trades, candidate selection and locking
//!
//! Owns the Order and Trade entities and every atomic multi-entity mutation
//! on them: reservation at submit, refund at cancel, and trade settlement.
//! Also provides the advisory-lock manager the matching pass uses to mark
//! candidate orders without holding row locks, and the singleton engine-lock
//! row the processing loop acquires.

pub mod advisory;
pub mod commands;
pub mod repository;
pub mod service;

pub use advisory::{AdvisoryLocks, InMemoryLockRegistry, LockClass, PostgresAdvisoryLocks};
pub use commands::{BookSnapshot, NewOrder, Settlement};
pub use repository::{InMemoryOrderRepository, OrderRepository, PostgresOrderRepository};
pub use service::OrderLifecycle;
