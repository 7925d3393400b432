use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{error, info, warn};
use validator::Validate;

use super::models::*;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{
    NewPaymentOrder, PaymentMethod, PaymentMethodType, PaymentOrder, PaymentOrderFilter,
    PaymentStatus, TokenPackage,
};
use crate::ledger::{LedgerStore, LedgerTx, TokenLedger};
use crate::orders::models::UploadedFile;
use crate::orders::storage::{checked_extension, UploadStorage};

const PROOF_DIR: &str = "payment-proofs";

/// Token purchases: payment orders, proof uploads and staff verification.
pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
    storage: UploadStorage,
    max_proof_bytes: usize,
    proof_url_prefix: String,
    order_ttl: Duration,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        storage: UploadStorage,
        max_proof_bytes: usize,
        proof_url_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            storage,
            max_proof_bytes,
            proof_url_prefix: proof_url_prefix.into(),
            order_ttl: Duration::hours(24),
        }
    }

    pub async fn list_packages(&self) -> AppResult<Vec<TokenPackage>> {
        self.store.list_packages().await
    }

    pub async fn list_payment_methods(&self) -> AppResult<Vec<PaymentMethod>> {
        self.store.list_payment_methods().await
    }

    /// Open a pending purchase of a catalog package, valid for 24 hours.
    pub async fn create_order(
        &self,
        user_id: i64,
        request: CreatePaymentOrderRequest,
    ) -> AppResult<PaymentOrder> {
        request.validate()?;
        if self.store.get_user(user_id).await?.is_none() {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }
        let method: PaymentMethodType = request.payment_method.parse()?;

        let offered = self
            .store
            .list_payment_methods()
            .await?
            .iter()
            .any(|m| m.method_type == method);
        if !offered {
            return Err(AppError::Validation(format!(
                "Payment method {} is not available",
                request.payment_method
            )));
        }

        let package = self
            .store
            .get_package(request.package_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| AppError::NotFound(format!("Package {} not found", request.package_id)))?;

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let order = tx
            .insert_payment_order(NewPaymentOrder {
                order_number: generate_order_number(now),
                user_id,
                package_id: package.id,
                token_amount: package.token_amount,
                bonus_tokens: package.bonus_tokens,
                total_tokens: package.total_tokens(),
                price: package.price,
                payment_method: method,
                expires_at: now + self.order_ttl,
            })
            .await?;
        tx.commit().await?;

        info!(
            order_number = %order.order_number,
            user_id,
            package = %package.name,
            total_tokens = order.total_tokens,
            "💳 Payment order created"
        );
        Ok(order)
    }

    /// Attach the customer's transfer proof and move the order to `paid`.
    pub async fn upload_proof(
        &self,
        payment_order_id: i64,
        user_id: i64,
        file: UploadedFile,
        details: ProofDetails,
    ) -> AppResult<PaymentOrder> {
        if file.bytes.is_empty() {
            return Err(AppError::Validation("Payment proof file is required".to_string()));
        }
        if file.bytes.len() > self.max_proof_bytes {
            return Err(AppError::Validation(format!(
                "Payment proof exceeds the {} byte limit",
                self.max_proof_bytes
            )));
        }
        let extension = checked_extension(&file.filename, ALLOWED_PROOF_EXTENSIONS)?;

        let stored = self.storage.store(PROOF_DIR, &extension, &file.bytes).await?;
        let proof_url = format!(
            "{}/{}",
            self.proof_url_prefix.trim_end_matches('/'),
            stored.file_name
        );

        let mut tx = self.store.begin().await?;
        let result = Self::attach_proof(
            tx.as_mut(),
            payment_order_id,
            user_id,
            stored.path.to_string_lossy().into_owned(),
            proof_url,
            details,
        )
        .await;

        let order = match result {
            Ok(order) => tx.commit().await.map(|_| order),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "Rollback failed after proof upload error");
                }
                Err(e)
            }
        };

        match order {
            Ok(order) => {
                info!(order_number = %order.order_number, user_id, "Payment proof uploaded");
                Ok(order)
            }
            Err(e) => {
                self.storage.remove(&stored.path).await;
                Err(e)
            }
        }
    }

    async fn attach_proof(
        tx: &mut dyn LedgerTx,
        payment_order_id: i64,
        user_id: i64,
        proof_path: String,
        proof_url: String,
        details: ProofDetails,
    ) -> AppResult<PaymentOrder> {
        let mut order = tx
            .lock_payment_order(payment_order_id)
            .await?
            .filter(|o| o.user_id == user_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Payment order {} not found", payment_order_id))
            })?;

        if order.status != PaymentStatus::Pending {
            return Err(AppError::InvalidState {
                current: order.status.to_string(),
                expected: PaymentStatus::Pending.to_string(),
            });
        }
        let now = Utc::now();
        if order.is_expired(now) {
            return Err(AppError::InvalidState {
                current: "expired".to_string(),
                expected: PaymentStatus::Pending.to_string(),
            });
        }

        order.status = PaymentStatus::Paid;
        order.payment_proof_path = Some(proof_path);
        order.payment_proof_url = Some(proof_url);
        order.transfer_amount = details.transfer_amount;
        order.transfer_date = Some(details.transfer_date.unwrap_or(now));
        order.transfer_notes = details.transfer_notes;
        tx.save_payment_order(&order).await?;

        Ok(order)
    }

    /// Staff approval or rejection of a paid order.
    ///
    /// Only `paid` orders can be verified, so a repeated approval fails with
    /// `InvalidState` instead of crediting twice.
    pub async fn verify(
        &self,
        payment_order_id: i64,
        request: VerifyPaymentRequest,
        staff_id: i64,
    ) -> AppResult<VerifyOutcome> {
        let action: VerifyAction = request.action.parse()?;
        request.validate()?;

        let mut tx = self.store.begin().await?;
        let result = Self::apply_verification(
            tx.as_mut(),
            payment_order_id,
            action,
            staff_id,
            request.notes,
        )
        .await;

        match result {
            Ok(outcome) => {
                tx.commit().await?;
                match outcome {
                    VerifyOutcome::Approved { tokens_credited, balance_after } => info!(
                        payment_order_id,
                        staff_id,
                        tokens_credited,
                        balance_after,
                        "✅ Payment approved"
                    ),
                    VerifyOutcome::Rejected => {
                        info!(payment_order_id, staff_id, "Payment rejected")
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "Rollback failed after verification error");
                }
                if matches!(e, AppError::InvalidState { .. }) {
                    warn!(payment_order_id, staff_id, error = %e, "Verification refused");
                }
                Err(e)
            }
        }
    }

    async fn apply_verification(
        tx: &mut dyn LedgerTx,
        payment_order_id: i64,
        action: VerifyAction,
        staff_id: i64,
        notes: Option<String>,
    ) -> AppResult<VerifyOutcome> {
        let mut order = tx.lock_payment_order(payment_order_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("Payment order {} not found", payment_order_id))
        })?;

        if order.status != PaymentStatus::Paid {
            return Err(AppError::InvalidState {
                current: order.status.to_string(),
                expected: PaymentStatus::Paid.to_string(),
            });
        }

        let now = Utc::now();
        order.verified_by = Some(staff_id);
        order.verified_at = Some(now);

        match action {
            VerifyAction::Approve => {
                order.status = PaymentStatus::Completed;
                order.verification_notes = notes;
                tx.save_payment_order(&order).await?;

                let entry = TokenLedger::credit(
                    tx,
                    order.user_id,
                    order.total_tokens,
                    &format!("Token purchase approved - Order {}", order.order_number),
                    Some(order.id),
                )
                .await?;

                Ok(VerifyOutcome::Approved {
                    tokens_credited: order.total_tokens,
                    balance_after: entry.balance_after,
                })
            }
            VerifyAction::Reject => {
                order.status = PaymentStatus::Rejected;
                order.rejection_reason = notes;
                tx.save_payment_order(&order).await?;
                Ok(VerifyOutcome::Rejected)
            }
        }
    }

    pub async fn list_user_orders(
        &self,
        user_id: i64,
        status: Option<&str>,
    ) -> AppResult<Vec<PaymentOrder>> {
        let status = status.map(str::parse::<PaymentStatus>).transpose()?;
        self.store
            .list_payment_orders(&PaymentOrderFilter {
                user_id: Some(user_id),
                status,
            })
            .await
    }

    /// Orders with proof uploaded, waiting for staff.
    pub async fn list_pending(&self) -> AppResult<Vec<PaymentOrder>> {
        self.store
            .list_payment_orders(&PaymentOrderFilter {
                user_id: None,
                status: Some(PaymentStatus::Paid),
            })
            .await
    }
}

/// `PAY-<yyyymmddHHMMSS>-<4 digits>`
fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::rng().random_range(0..10000);
    format!("PAY-{}-{:04}", now.format("%Y%m%d%H%M%S"), suffix)
}
