//! Matching engine: pairing algorithm, settlement, and the processing loop
//!
//! The pairing algorithm is pure: it walks a pre-fetched, pre-sorted
//! candidate list with two cursors and reports matches. The processing loop
//! is the singleton worker that drains matchable orders, one committed
//! trade per transaction, woken by a pub/sub signal on new-order arrival
//! with a poll-timeout fallback.

pub mod config;
pub mod engine;
pub mod pairing;
pub mod settlement;
pub mod wake;

pub use config::EngineConfig;
pub use engine::ProcessingEngine;
pub use pairing::{next_match, Cursors, MatchFound};
pub use settlement::plan_trade;
pub use wake::{InProcessWake, PgWakeChannel, Wake, WakeChannel, WakeSubscription};
