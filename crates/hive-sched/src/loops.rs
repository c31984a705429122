use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::scheduler::Scheduler;

/// How often the reclaim/rebalance pass runs.
const TICK: Duration = Duration::from_secs(1);
/// History pruning cadence within the same loop.
const PRUNE_EVERY: u32 = 3_600;

/// Background loop: reclaim stale delegations every tick, rebalance idle
/// capacity, and prune old history on a slow cadence.
pub async fn run_reclaim_loop(scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                if let Err(e) = scheduler.reclaim_pass(now) {
                    warn!(error = %e, "reclaim pass failed");
                }
                if let Err(e) = scheduler.rebalance(now) {
                    warn!(error = %e, "rebalance failed");
                }
                ticks = ticks.wrapping_add(1);
                if ticks % PRUNE_EVERY == 0 {
                    match scheduler.prune_history(now) {
                        Ok(0) => {}
                        Ok(n) => debug!(pruned = n, "history pruned"),
                        Err(e) => warn!(error = %e, "history prune failed"),
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("reclaim loop stopped");
}
