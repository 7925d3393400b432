//! Dispatch reconciler.
//!
//! Submission commits the order before it talks to the queue, so a broker
//! outage can leave an order that is paid for but never reached the worker.
//! The reconciler periodically re-dispatches `processing` orders that were
//! never accepted by the queue.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::AppResult;
use crate::ledger::LedgerStore;
use crate::orders::JobDispatcher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub struct DispatchReconciler {
    store: Arc<dyn LedgerStore>,
    dispatcher: Arc<JobDispatcher>,
    config: ReconcileConfig,
}

impl DispatchReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, dispatcher: Arc<JobDispatcher>, config: ReconcileConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// One pass over stale undispatched orders.
    pub async fn sweep_once(&self) -> AppResult<SweepReport> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_after_secs);
        let orders = self
            .store
            .find_undispatched_orders(cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            scanned: orders.len(),
            ..Default::default()
        };

        for order in &orders {
            match self.dispatcher.dispatch(order).await {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    warn!(
                        order_ref = %order.order_ref,
                        attempts = order.dispatch_attempts + 1,
                        error = %e,
                        "Re-dispatch failed"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                dispatched = report.dispatched,
                failed = report.failed,
                "🔁 Dispatch sweep finished"
            );
        } else {
            debug!("Dispatch sweep found nothing to do");
        }
        Ok(report)
    }

    /// Run `sweep_once` every `interval_secs` until `shutdown` flips to true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = self.config.interval_secs,
                stale_after_secs = self.config.stale_after_secs,
                "✅ Dispatch reconciler started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!(error = %e, "Dispatch sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Dispatch reconciler stopped");
        })
    }
}
