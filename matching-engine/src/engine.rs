//! The singleton processing loop
//!
//! Exactly one instance may run system-wide, enforced by the engine-lock
//! row. The loop blocks on the wake channel with a poll-timeout fallback,
//! stamps the trade clock, and drains matchable orders; every trade commits
//! in its own transaction, and a failing iteration is logged rather than
//! fatal. Advisory locks taken while fetching candidates are released
//! unconditionally at the end of every pass.

use std::sync::Arc;

use chrono::Utc;
use common::error::Result;
use common::model::order::Order;
use order_store::{AdvisoryLocks, LockClass, OrderRepository};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::pairing::{next_match, Cursors};
use crate::settlement::plan_trade;
use crate::wake::WakeChannel;

/// The processing loop over a repository, an advisory-lock session, and a
/// wake channel
pub struct ProcessingEngine {
    repo: Arc<dyn OrderRepository>,
    locks: Arc<dyn AdvisoryLocks>,
    wake: Arc<dyn WakeChannel>,
    config: EngineConfig,
}

impl ProcessingEngine {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        locks: Arc<dyn AdvisoryLocks>,
        wake: Arc<dyn WakeChannel>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            locks,
            wake,
            config,
        }
    }

    /// Acquire the engine lock. Fails fast with `EngineAlreadyRunning` when
    /// another instance holds it and `force` was not requested; `force`
    /// steals the lock (operator recovery after a crash).
    pub async fn acquire(&self, force: bool) -> Result<()> {
        self.repo.acquire_engine_lock(Utc::now(), force).await?;
        info!("Engine lock acquired (force = {})", force);
        Ok(())
    }

    /// Run until `shutdown` flips to true. Acquires the engine lock, then
    /// loops: wait for a wake message or the poll timeout, drain matches,
    /// repeat. On exit the advisory session is cleared and the engine lock
    /// released.
    pub async fn run(&self, force: bool, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.acquire(force).await?;

        let result = self.run_inner(&mut shutdown).await;

        // Cleanup must happen whether the loop ended cleanly or not
        if let Err(e) = self.locks.unlock_all().await {
            warn!("Failed to release advisory locks on shutdown: {}", e);
        }
        if let Err(e) = self.repo.release_engine_lock().await {
            error!("Failed to release engine lock on shutdown: {}", e);
        }
        info!("Engine stopped");
        result
    }

    async fn run_inner(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let mut subscription = self.wake.subscribe().await?;
        info!(
            "Engine running; wake channel ready, poll interval {:?}",
            self.config.poll_interval
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            // Wait for a wake message, the poll timeout, or shutdown,
            // whichever comes first. Timeout and message are handled the
            // same way: missed or duplicated wakes are harmless.
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                wake = subscription.wait(self.config.poll_interval) => {
                    let wake = wake?;
                    debug!("Engine woke: {:?}", wake);
                    self.drain().await;
                }
            }
        }
    }

    /// Stamp the trade clock and run matching passes until one commits no
    /// trades. A failing pass is logged and ends the drain; the loop
    /// retries on the next wake or timeout.
    pub async fn drain(&self) {
        loop {
            let trade_at = Utc::now();
            if let Err(e) = self.repo.stamp_trade_at(trade_at).await {
                error!("Failed to stamp trade clock: {}", e);
                return;
            }

            match self.run_pass(trade_at).await {
                Ok(0) => return,
                Ok(n) => debug!("Pass committed {} trade(s)", n),
                Err(e) => {
                    // A single iteration's failure must not kill the engine
                    error!("Matching iteration failed: {}", e);
                    return;
                }
            }
        }
    }

    /// One matching pass: fetch the locked candidate set, settle matches,
    /// then release every advisory lock taken, even on error.
    async fn run_pass(&self, trade_at: chrono::DateTime<Utc>) -> Result<usize> {
        let candidates = self.repo.candidates(trade_at, self.locks.as_ref()).await?;
        let locked_seqs: Vec<i64> = candidates.iter().map(|o| o.seq).collect();

        let result = self.settle_pass(candidates, trade_at).await;

        for seq in locked_seqs {
            if let Err(e) = self.locks.unlock(LockClass::Order, seq).await {
                warn!("Failed to release advisory lock for order seq {}: {}", seq, e);
            }
        }

        result
    }

    async fn settle_pass(
        &self,
        mut candidates: Vec<Order>,
        trade_at: chrono::DateTime<Utc>,
    ) -> Result<usize> {
        let mut cursors = Cursors::new(&candidates);
        let mut committed = 0usize;

        while let Some(found) = next_match(&candidates, &mut cursors) {
            let plan = plan_trade(
                &candidates[found.sell_idx],
                &candidates[found.buy_idx],
                trade_at,
            );
            let trade = self.repo.execute_settlement(plan).await?;
            committed += 1;
            info!(
                "Trade {}: {} @ {} on pair {} (overpayment {})",
                trade.id, trade.filled_quantity, trade.price, trade.pair.id, trade.overpayment_amount
            );

            // Mirror the fills onto the snapshot so cursor advancement and
            // subsequent fills see the remaining quantities
            candidates[found.sell_idx].apply_fill(found.fill_quantity, trade_at)?;
            candidates[found.buy_idx].apply_fill(found.fill_quantity, trade_at)?;

            if !candidates[found.sell_idx].is_active() {
                cursors.sell += 1;
            }
            if !candidates[found.buy_idx].is_active() {
                if cursors.buy == 0 {
                    break;
                }
                cursors.buy -= 1;
            }

            if self.config.trade_per_iteration {
                // One trade per iteration: yield so the next iteration
                // re-stamps the clock and re-fetches candidates
                break;
            }
        }

        Ok(committed)
    }
}
