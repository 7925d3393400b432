use chrono::Utc;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use validator::Validate;

use super::dispatch::JobDispatcher;
use super::models::*;
use super::pricing::TokenPricing;
use super::storage::{checked_extension, UploadStorage};
use crate::error::{AppError, AppResult};
use crate::ledger::models::{NewOrder, Order, OrderFilter, OrderStatus};
use crate::ledger::{LedgerEntry, LedgerStore, LedgerTx, TokenLedger};

const UPLOAD_DIR: &str = "uploads";

pub const DISPATCH_WARNING: &str =
    "Order saved but could not be queued for processing yet; it will be retried automatically";

/// Order submission and staff order management.
pub struct OrderService {
    store: Arc<dyn LedgerStore>,
    pricing: TokenPricing,
    storage: UploadStorage,
    dispatcher: Arc<JobDispatcher>,
    max_upload_bytes: usize,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        pricing: TokenPricing,
        storage: UploadStorage,
        dispatcher: Arc<JobDispatcher>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            store,
            pricing,
            storage,
            dispatcher,
            max_upload_bytes,
        }
    }

    /// Debit the caller, persist the order, then hand it to the worker queue.
    ///
    /// The debit, ledger entry and order row commit together or not at all;
    /// on any failure before commit the stored upload is deleted. Queue
    /// trouble after commit only adds a warning.
    pub async fn submit(
        &self,
        user_id: i64,
        file: UploadedFile,
        request: SubmitOrderRequest,
    ) -> AppResult<SubmittedOrder> {
        request.validate()?;
        if file.bytes.is_empty() {
            return Err(AppError::Validation("Uploaded file is empty".to_string()));
        }
        if file.bytes.len() > self.max_upload_bytes {
            return Err(AppError::Validation(format!(
                "File exceeds the {} byte upload limit",
                self.max_upload_bytes
            )));
        }
        let extension = checked_extension(&file.filename, ALLOWED_DOCUMENT_EXTENSIONS)?;

        let cost = self.pricing.cost_for(request.page_count);
        let stored = self.storage.store(UPLOAD_DIR, &extension, &file.bytes).await?;

        let (order, entry) = match self
            .commit_order(user_id, cost, &file.filename, stored.path.clone(), &request)
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                self.storage.remove(&stored.path).await;
                return Err(e);
            }
        };

        info!(
            order_ref = %order.order_ref,
            user_id,
            cost,
            balance_after = entry.balance_after,
            "🧾 Order committed"
        );

        let mut warnings = Vec::new();
        if self.dispatcher.dispatch(&order).await.is_err() {
            warnings.push(DISPATCH_WARNING.to_string());
        }

        Ok(SubmittedOrder {
            order,
            tokens_remaining: entry.balance_after,
            warnings,
        })
    }

    async fn commit_order(
        &self,
        user_id: i64,
        cost: i64,
        original_filename: &str,
        file_path: PathBuf,
        request: &SubmitOrderRequest,
    ) -> AppResult<(Order, LedgerEntry)> {
        let mut tx = self.store.begin().await?;

        match Self::write_order(tx.as_mut(), user_id, cost, original_filename, file_path, request).await {
            Ok(written) => {
                tx.commit().await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "Rollback failed after order error");
                }
                Err(e)
            }
        }
    }

    async fn write_order(
        tx: &mut dyn LedgerTx,
        user_id: i64,
        cost: i64,
        original_filename: &str,
        file_path: PathBuf,
        request: &SubmitOrderRequest,
    ) -> AppResult<(Order, LedgerEntry)> {
        let order_id = tx.reserve_order_id().await?;
        let order_ref = generate_order_ref();

        let entry = TokenLedger::debit(
            tx,
            user_id,
            cost,
            &format!("Format order {}", order_ref),
            Some(order_id),
        )
        .await?;

        let order = tx
            .insert_order(NewOrder {
                id: order_id,
                order_ref,
                user_id,
                original_filename: original_filename.to_string(),
                file_path: file_path.to_string_lossy().into_owned(),
                document_type: request.document_type.clone(),
                template_id: request.template_id.clone(),
                service_level: request.service_level.clone(),
                copies: request.copies,
                binding_type: request.binding_type.clone(),
                color_mode: request.color_mode,
                notes: request.notes.clone(),
                tokens_required: cost,
                tokens_spent: cost,
            })
            .await?;

        Ok((order, entry))
    }

    pub async fn get(&self, order_ref: &str) -> AppResult<Order> {
        self.store
            .get_order_by_ref(order_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_ref)))
    }

    /// Staff listing across all users.
    pub async fn list(&self, query: &ListOrdersQuery) -> AppResult<(Vec<Order>, i64)> {
        query.validate()?;
        let status = query
            .status
            .as_deref()
            .map(str::parse::<OrderStatus>)
            .transpose()?;

        self.store
            .list_orders(&OrderFilter {
                user_id: None,
                status,
                page: query.page(),
                limit: query.limit(),
            })
            .await
    }

    pub async fn list_user(&self, user_id: i64, query: &ListOrdersQuery) -> AppResult<(Vec<Order>, i64)> {
        query.validate()?;
        let status = query
            .status
            .as_deref()
            .map(str::parse::<OrderStatus>)
            .transpose()?;

        self.store
            .list_orders(&OrderFilter {
                user_id: Some(user_id),
                status,
                page: query.page(),
                limit: query.limit(),
            })
            .await
    }

    /// Staff-driven status change. Completed and cancelled orders are final.
    pub async fn update_status(
        &self,
        order_ref: &str,
        request: UpdateOrderStatusRequest,
        staff_id: i64,
    ) -> AppResult<Order> {
        request.validate()?;
        let status: OrderStatus = request.status.parse()?;
        if !status.is_staff_target() {
            return Err(AppError::Validation(format!(
                "Status {} cannot be set by staff",
                status
            )));
        }

        let mut tx = self.store.begin().await?;
        let current = tx
            .lock_order_by_ref(order_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_ref)))?;

        if current.status.is_terminal() {
            tx.rollback().await?;
            return Err(AppError::InvalidState {
                current: current.status.to_string(),
                expected: "an open order".to_string(),
            });
        }

        let updated = tx.update_order_status(current.id, status, request.notes).await?;
        tx.commit().await?;

        info!(
            order_ref,
            staff_id,
            from = %current.status,
            to = %updated.status,
            "Order status updated"
        );
        Ok(updated)
    }
}

/// `ORD-<unix millis>-<4 digits>`
fn generate_order_ref() -> String {
    let suffix: u16 = rand::rng().random_range(1000..10000);
    format!("ORD-{}-{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;
    use crate::queue::{InMemoryJobQueue, JobDescriptor, JobQueue};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub store: Arc<InMemoryLedgerStore>,
        pub queue: Arc<InMemoryJobQueue>,
        pub service: OrderService,
        pub dir: TempDir,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryLedgerStore::new(Duration::from_millis(500)));
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Arc::new(JobDispatcher::new(
            store.clone(),
            queue.clone(),
            dir.path().join("outputs"),
        ));
        let service = OrderService::new(
            store.clone(),
            TokenPricing::fixed(1),
            UploadStorage::new(dir.path()),
            dispatcher,
            1024 * 1024,
        );
        Fixture {
            store,
            queue,
            service,
            dir,
        }
    }

    pub(crate) fn pdf() -> UploadedFile {
        UploadedFile {
            filename: "skripsi.pdf".to_string(),
            bytes: Bytes::from_static(b"%PDF-1.7 test document"),
        }
    }

    pub(crate) fn request() -> SubmitOrderRequest {
        SubmitOrderRequest {
            document_type: "skripsi".to_string(),
            service_level: "standard".to_string(),
            copies: 2,
            binding_type: Some("hardcover".to_string()),
            color_mode: false,
            notes: None,
            template_id: None,
            page_count: None,
        }
    }

    fn uploads_in(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path().join(UPLOAD_DIR))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_submit_debits_and_enqueues() {
        let f = fixture();
        let user = f.store.seed_user(5);

        let submitted = f.service.submit(user.id, pdf(), request()).await.unwrap();

        assert_eq!(submitted.tokens_remaining, 4);
        assert!(submitted.warnings.is_empty());
        assert_eq!(submitted.order.status, OrderStatus::Processing);
        assert_eq!(submitted.order.tokens_required, 1);
        assert_eq!(submitted.order.tokens_spent, 1);
        assert!(submitted.order.order_ref.starts_with("ORD-"));

        let entries = f.store.list_transactions(user.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, -1);
        assert_eq!(entries[0].balance_before, 5);
        assert_eq!(entries[0].balance_after, 4);
        assert_eq!(entries[0].order_id, Some(submitted.order.id));

        let job: JobDescriptor = f.queue.pop().unwrap();
        assert_eq!(job.job_type, "format");
        assert_eq!(job.order_ref, submitted.order.order_ref);
        assert_eq!(job.id, submitted.order.id.to_string());
        assert_eq!(job.format_ref, "CATEGORY:skripsi");
        assert_eq!(job.user_id, user.id);

        let stored = f.store.get_order(submitted.order.id).await.unwrap().unwrap();
        assert!(stored.dispatched_at.is_some());
        assert!(std::path::Path::new(&stored.file_path).exists());
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_no_trace() {
        let f = fixture();
        let user = f.store.seed_user(0);

        let result = f.service.submit(user.id, pdf(), request()).await;

        assert!(matches!(
            result,
            Err(AppError::InsufficientBalance { required: 1, available: 0 })
        ));
        assert_eq!(f.store.order_count(), 0);
        assert!(f.store.list_transactions(user.id).await.unwrap().is_empty());
        assert_eq!(uploads_in(&f.dir), 0);
        assert_eq!(f.queue.len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_cleaned_up() {
        let f = fixture();

        let result = f.service.submit(999, pdf(), request()).await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(f.store.order_count(), 0);
        assert_eq!(uploads_in(&f.dir), 0);
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_side_effect() {
        let f = fixture();
        let user = f.store.seed_user(5);

        let mut missing_type = request();
        missing_type.document_type = String::new();
        assert!(matches!(
            f.service.submit(user.id, pdf(), missing_type).await,
            Err(AppError::Validation(_))
        ));

        let mut too_many = request();
        too_many.copies = 0;
        assert!(matches!(
            f.service.submit(user.id, pdf(), too_many).await,
            Err(AppError::Validation(_))
        ));

        let exe = UploadedFile {
            filename: "setup.exe".to_string(),
            bytes: Bytes::from_static(b"MZ"),
        };
        assert!(matches!(
            f.service.submit(user.id, exe, request()).await,
            Err(AppError::Validation(_))
        ));

        let oversized = UploadedFile {
            filename: "big.pdf".to_string(),
            bytes: Bytes::from(vec![0u8; 1024 * 1024 + 1]),
        };
        assert!(matches!(
            f.service.submit(user.id, oversized, request()).await,
            Err(AppError::Validation(_))
        ));

        assert_eq!(uploads_in(&f.dir), 0);
        assert_eq!(f.store.get_user(user.id).await.unwrap().unwrap().token_balance, 5);
    }

    #[tokio::test]
    async fn test_queue_outage_keeps_the_order() {
        let f = fixture();
        let user = f.store.seed_user(3);
        f.queue.set_unavailable(true);

        let submitted = f.service.submit(user.id, pdf(), request()).await.unwrap();

        assert_eq!(submitted.tokens_remaining, 2);
        assert_eq!(submitted.warnings, vec![DISPATCH_WARNING.to_string()]);

        let stored = f.store.get_order(submitted.order.id).await.unwrap().unwrap();
        assert!(stored.dispatched_at.is_none());
        assert_eq!(stored.dispatch_attempts, 1);
    }

    #[tokio::test]
    async fn test_queued_job_without_dispatch_mark_is_not_a_failure() {
        let f = fixture();
        let user = f.store.seed_user(3);
        f.store.set_dispatch_writes_failing(true);

        let submitted = f.service.submit(user.id, pdf(), request()).await.unwrap();

        assert!(submitted.warnings.is_empty());
        assert_eq!(f.queue.depth().await.unwrap(), 1);
        let stored = f.store.get_order(submitted.order.id).await.unwrap().unwrap();
        assert!(stored.dispatched_at.is_none());
    }

    #[tokio::test]
    async fn test_template_ref_in_job() {
        let f = fixture();
        let user = f.store.seed_user(1);
        let mut req = request();
        req.template_id = Some("ugm-skripsi".to_string());

        f.service.submit(user.id, pdf(), req).await.unwrap();

        assert_eq!(f.queue.pop().unwrap().format_ref, "TEMPLATE:ugm-skripsi");
    }

    #[tokio::test]
    async fn test_status_updates_stop_at_terminal_states() {
        let f = fixture();
        let user = f.store.seed_user(2);
        let order = f.service.submit(user.id, pdf(), request()).await.unwrap().order;

        let update = |status: &str| UpdateOrderStatusRequest {
            status: status.to_string(),
            notes: Some("checked".to_string()),
        };

        let ready = f
            .service
            .update_status(&order.order_ref, update("READY"), 77)
            .await
            .unwrap();
        assert_eq!(ready.status, OrderStatus::Ready);
        assert_eq!(ready.staff_notes.as_deref(), Some("checked"));

        f.service
            .update_status(&order.order_ref, update("completed"), 77)
            .await
            .unwrap();

        assert!(matches!(
            f.service.update_status(&order.order_ref, update("in_progress"), 77).await,
            Err(AppError::InvalidState { .. })
        ));
        assert!(matches!(
            f.service.update_status(&order.order_ref, update("processing"), 77).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            f.service.update_status("ORD-missing", update("ready"), 77).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_is_scoped_and_paginated() {
        let f = fixture();
        let alice = f.store.seed_user(5);
        let bob = f.store.seed_user(5);
        for _ in 0..3 {
            f.service.submit(alice.id, pdf(), request()).await.unwrap();
        }
        f.service.submit(bob.id, pdf(), request()).await.unwrap();

        let query = ListOrdersQuery {
            status: None,
            page: Some(1),
            limit: Some(2),
        };
        let (page, total) = f.service.list_user(alice.id, &query).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|o| o.user_id == alice.id));

        let (all, total) = f
            .service
            .list(&ListOrdersQuery {
                status: Some("processing".to_string()),
                page: None,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(total, 4);
        assert_eq!(all.len(), 4);

        assert!(matches!(
            f.service
                .list(&ListOrdersQuery {
                    status: Some("shipped".to_string()),
                    page: None,
                    limit: None,
                })
                .await,
            Err(AppError::Validation(_))
        ));

        assert_eq!(f.queue.depth().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_page_beyond_bound_is_rejected() {
        let f = fixture();
        let user = f.store.seed_user(5);

        let query = ListOrdersQuery {
            status: None,
            page: Some(i64::MAX),
            limit: Some(20),
        };
        assert!(matches!(
            f.service.list_user(user.id, &query).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(f.service.list(&query).await, Err(AppError::Validation(_))));
    }
}
