//! Storage seam for the ledger.
//!
//! [`LedgerStore`] covers committed reads and the few single-statement writes
//! that sit outside the ledger invariants (dispatch bookkeeping).
//! Everything that moves tokens or changes an order/payment state goes through
//! a [`LedgerTx`]: rows fetched with a `lock_*` method stay locked until the
//! transaction is committed, rolled back, or dropped (which rolls back).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use crate::error::AppResult;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction with the configured lock timeout applied.
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>>;

    async fn ping(&self) -> AppResult<()>;

    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>>;

    async fn get_order(&self, order_id: i64) -> AppResult<Option<Order>>;

    async fn get_order_by_ref(&self, order_ref: &str) -> AppResult<Option<Order>>;

    /// Newest first, with the total count matching the filter.
    async fn list_orders(&self, filter: &OrderFilter) -> AppResult<(Vec<Order>, i64)>;

    /// A user's ledger entries in creation order.
    async fn list_transactions(&self, user_id: i64) -> AppResult<Vec<TokenTransaction>>;

    /// At most `limit` of a user's latest ledger entries, newest first.
    async fn list_recent_transactions(&self, user_id: i64, limit: i64) -> AppResult<Vec<TokenTransaction>>;

    async fn get_payment_order(&self, payment_order_id: i64) -> AppResult<Option<PaymentOrder>>;

    /// Newest first.
    async fn list_payment_orders(&self, filter: &PaymentOrderFilter) -> AppResult<Vec<PaymentOrder>>;

    async fn list_packages(&self) -> AppResult<Vec<TokenPackage>>;

    async fn get_package(&self, package_id: i64) -> AppResult<Option<TokenPackage>>;

    async fn list_payment_methods(&self) -> AppResult<Vec<PaymentMethod>>;

    /// Record that the order's job descriptor was accepted by the queue.
    async fn mark_dispatched(&self, order_id: i64) -> AppResult<()>;

    async fn record_dispatch_failure(&self, order_id: i64) -> AppResult<()>;

    /// Orders still `processing`, never dispatched, created before `older_than`.
    async fn find_undispatched_orders(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Order>>;
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Exclusive lock on the user row (`SELECT ... FOR UPDATE`).
    async fn lock_user(&mut self, user_id: i64) -> AppResult<Option<User>>;

    /// Only valid for a user locked in this transaction.
    async fn write_balance(&mut self, update: BalanceUpdate) -> AppResult<()>;

    async fn append_transaction(&mut self, entry: NewTokenTransaction) -> AppResult<TokenTransaction>;

    /// Reserve the next order id without writing the row.
    async fn reserve_order_id(&mut self) -> AppResult<i64>;

    async fn insert_order(&mut self, order: NewOrder) -> AppResult<Order>;

    async fn lock_order_by_ref(&mut self, order_ref: &str) -> AppResult<Option<Order>>;

    async fn update_order_status(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        staff_notes: Option<String>,
    ) -> AppResult<Order>;

    async fn insert_payment_order(&mut self, order: NewPaymentOrder) -> AppResult<PaymentOrder>;

    async fn lock_payment_order(&mut self, payment_order_id: i64) -> AppResult<Option<PaymentOrder>>;

    /// Persist status, proof, and verification columns of a locked payment order.
    async fn save_payment_order(&mut self, order: &PaymentOrder) -> AppResult<()>;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}
