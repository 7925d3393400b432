use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::ledger::{models::Order, LedgerStore};
use crate::queue::{JobDescriptor, JobQueue};

/// Pushes committed orders to the job queue and records the outcome on the
/// order row. Shared by the submission flow and the reconciler.
pub struct JobDispatcher {
    store: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
    output_dir: PathBuf,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn LedgerStore>, queue: Arc<dyn JobQueue>, output_dir: PathBuf) -> Self {
        Self {
            store,
            queue,
            output_dir,
        }
    }

    /// Enqueue the order's descriptor. On queue failure the order stays
    /// undispatched and the queue error is returned. Once the queue has the
    /// job this succeeds even if recording the dispatch fails.
    pub async fn dispatch(&self, order: &Order) -> AppResult<()> {
        let job = JobDescriptor::format_order(order, &self.output_dir);

        match self.queue.enqueue(&job).await {
            Ok(()) => {
                info!(order_ref = %order.order_ref, "📤 Format job dispatched");
                // Already queued. An unmarked order is sent again by the reconciler.
                if let Err(e) = self.store.mark_dispatched(order.id).await {
                    warn!(order_ref = %order.order_ref, error = %e, "Job queued but dispatch was not recorded");
                }
                Ok(())
            }
            Err(e) => {
                warn!(order_ref = %order.order_ref, error = %e, "Format job dispatch failed");
                if let Err(record_err) = self.store.record_dispatch_failure(order.id).await {
                    warn!(order_ref = %order.order_ref, error = %record_err, "Could not record dispatch failure");
                }
                Err(AppError::Queue(e))
            }
        }
    }
}
