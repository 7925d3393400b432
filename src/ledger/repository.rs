use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;

use super::models::*;
use super::store::{LedgerStore, LedgerTx};
use crate::error::{AppError, AppResult};

macro_rules! user_columns {
    () => {
        "id, token_balance, total_tokens_spent, total_tokens_purchased, created_at, updated_at"
    };
}

macro_rules! order_columns {
    () => {
        "id, order_ref, user_id, status, original_filename, file_path, document_type, \
         template_id, service_level, copies, binding_type, color_mode, notes, staff_notes, \
         tokens_required, tokens_spent, dispatched_at, dispatch_attempts, created_at, updated_at"
    };
}

macro_rules! payment_order_columns {
    () => {
        "id, order_number, user_id, package_id, token_amount, bonus_tokens, total_tokens, \
         price, payment_method, status, payment_proof_path, payment_proof_url, \
         transfer_amount, transfer_date, transfer_notes, verified_by, verified_at, \
         verification_notes, rejection_reason, expires_at, created_at, updated_at"
    };
}

macro_rules! transaction_columns {
    () => {
        "id, user_id, amount, balance_before, balance_after, transaction_type, description, \
         order_id, payment_order_id, created_at"
    };
}

/// Ledger repository - THE source of truth for balances, orders and payments
pub struct LedgerRepository {
    pub pool: PgPool,
    lock_timeout: Duration,
}

impl LedgerRepository {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;

        // SET LOCAL does not accept bind parameters; the values are integers we own.
        let lock_ms = self.lock_timeout.as_millis();
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", lock_ms))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = '{}ms'", lock_ms * 2))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_order(&self, order_id: i64) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn get_order_by_ref(&self, order_ref: &str) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE order_ref = $1"
        ))
        .bind(order_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn list_orders(&self, filter: &OrderFilter) -> AppResult<(Vec<Order>, i64)> {
        let orders = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders",
            " WHERE ($1::BIGINT IS NULL OR user_id = $1)",
            " AND ($2::order_status IS NULL OR status = $2)",
            " ORDER BY created_at DESC, id DESC",
            " LIMIT $3 OFFSET $4"
        ))
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM orders
            WHERE ($1::BIGINT IS NULL OR user_id = $1)
              AND ($2::order_status IS NULL OR status = $2)
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        Ok((orders, total))
    }

    async fn list_transactions(&self, user_id: i64) -> AppResult<Vec<TokenTransaction>> {
        let entries = sqlx::query_as::<_, TokenTransaction>(concat!(
            "SELECT ",
            transaction_columns!(),
            " FROM token_transactions WHERE user_id = $1 ORDER BY id ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn list_recent_transactions(&self, user_id: i64, limit: i64) -> AppResult<Vec<TokenTransaction>> {
        let entries = sqlx::query_as::<_, TokenTransaction>(concat!(
            "SELECT ",
            transaction_columns!(),
            " FROM token_transactions WHERE user_id = $1 ORDER BY id DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn get_payment_order(&self, payment_order_id: i64) -> AppResult<Option<PaymentOrder>> {
        let order = sqlx::query_as::<_, PaymentOrder>(concat!(
            "SELECT ",
            payment_order_columns!(),
            " FROM payment_orders WHERE id = $1"
        ))
        .bind(payment_order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn list_payment_orders(&self, filter: &PaymentOrderFilter) -> AppResult<Vec<PaymentOrder>> {
        let orders = sqlx::query_as::<_, PaymentOrder>(concat!(
            "SELECT ",
            payment_order_columns!(),
            " FROM payment_orders",
            " WHERE ($1::BIGINT IS NULL OR user_id = $1)",
            " AND ($2::payment_status IS NULL OR status = $2)",
            " ORDER BY created_at DESC, id DESC"
        ))
        .bind(filter.user_id)
        .bind(filter.status)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn list_packages(&self) -> AppResult<Vec<TokenPackage>> {
        let packages = sqlx::query_as::<_, TokenPackage>(
            r#"
            SELECT id, name, token_amount, bonus_tokens, price, original_price,
                   discount_percentage, valid_days, is_popular, description, is_active
            FROM token_packages
            WHERE is_active = TRUE
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(packages)
    }

    async fn get_package(&self, package_id: i64) -> AppResult<Option<TokenPackage>> {
        let package = sqlx::query_as::<_, TokenPackage>(
            r#"
            SELECT id, name, token_amount, bonus_tokens, price, original_price,
                   discount_percentage, valid_days, is_popular, description, is_active
            FROM token_packages
            WHERE id = $1
            "#,
        )
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(package)
    }

    async fn list_payment_methods(&self) -> AppResult<Vec<PaymentMethod>> {
        let methods = sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT id, method_type, bank_name, account_number, account_name,
                   qris_merchant_name, qris_image_url, instructions, is_active
            FROM payment_methods
            WHERE is_active = TRUE
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(methods)
    }

    async fn mark_dispatched(&self, order_id: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET dispatched_at = NOW(), dispatch_attempts = dispatch_attempts + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_dispatch_failure(&self, order_id: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET dispatch_attempts = dispatch_attempts + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_undispatched_orders(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders",
            " WHERE status = 'processing' AND dispatched_at IS NULL AND created_at < $1",
            " ORDER BY id ASC",
            " LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }
}

/// One open Postgres transaction. Dropping it without commit rolls back.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_user(&mut self, user_id: i64) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(user)
    }

    async fn write_balance(&mut self, update: BalanceUpdate) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET token_balance = $2,
                total_tokens_spent = $3,
                total_tokens_purchased = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(update.user_id)
        .bind(update.token_balance)
        .bind(update.total_tokens_spent)
        .bind(update.total_tokens_purchased)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {} not found", update.user_id)));
        }

        Ok(())
    }

    async fn append_transaction(&mut self, entry: NewTokenTransaction) -> AppResult<TokenTransaction> {
        let transaction = sqlx::query_as::<_, TokenTransaction>(concat!(
            "INSERT INTO token_transactions",
            " (user_id, amount, balance_before, balance_after, transaction_type, description, order_id, payment_order_id)",
            " VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            " RETURNING ",
            transaction_columns!()
        ))
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.transaction_type)
        .bind(entry.description)
        .bind(entry.order_id)
        .bind(entry.payment_order_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(transaction)
    }

    async fn reserve_order_id(&mut self) -> AppResult<i64> {
        let id: i64 = sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('orders', 'id'))")
            .fetch_one(&mut *self.tx)
            .await?;

        Ok(id)
    }

    async fn insert_order(&mut self, order: NewOrder) -> AppResult<Order> {
        let order = sqlx::query_as::<_, Order>(concat!(
            "INSERT INTO orders",
            " (id, order_ref, user_id, status, original_filename, file_path, document_type,",
            " template_id, service_level, copies, binding_type, color_mode, notes,",
            " tokens_required, tokens_spent)",
            " VALUES ($1, $2, $3, 'processing', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            " RETURNING ",
            order_columns!()
        ))
        .bind(order.id)
        .bind(order.order_ref)
        .bind(order.user_id)
        .bind(order.original_filename)
        .bind(order.file_path)
        .bind(order.document_type)
        .bind(order.template_id)
        .bind(order.service_level)
        .bind(order.copies)
        .bind(order.binding_type)
        .bind(order.color_mode)
        .bind(order.notes)
        .bind(order.tokens_required)
        .bind(order.tokens_spent)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(order)
    }

    async fn lock_order_by_ref(&mut self, order_ref: &str) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE order_ref = $1 FOR UPDATE"
        ))
        .bind(order_ref)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(order)
    }

    async fn update_order_status(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        staff_notes: Option<String>,
    ) -> AppResult<Order> {
        let order = sqlx::query_as::<_, Order>(concat!(
            "UPDATE orders",
            " SET status = $2, staff_notes = COALESCE($3, staff_notes), updated_at = NOW()",
            " WHERE id = $1",
            " RETURNING ",
            order_columns!()
        ))
        .bind(order_id)
        .bind(status)
        .bind(staff_notes)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_id)))?;

        Ok(order)
    }

    async fn insert_payment_order(&mut self, order: NewPaymentOrder) -> AppResult<PaymentOrder> {
        let order = sqlx::query_as::<_, PaymentOrder>(concat!(
            "INSERT INTO payment_orders",
            " (order_number, user_id, package_id, token_amount, bonus_tokens, total_tokens,",
            " price, payment_method, status, expires_at)",
            " VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9)",
            " RETURNING ",
            payment_order_columns!()
        ))
        .bind(order.order_number)
        .bind(order.user_id)
        .bind(order.package_id)
        .bind(order.token_amount)
        .bind(order.bonus_tokens)
        .bind(order.total_tokens)
        .bind(order.price)
        .bind(order.payment_method)
        .bind(order.expires_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(order)
    }

    async fn lock_payment_order(&mut self, payment_order_id: i64) -> AppResult<Option<PaymentOrder>> {
        let order = sqlx::query_as::<_, PaymentOrder>(concat!(
            "SELECT ",
            payment_order_columns!(),
            " FROM payment_orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(payment_order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(order)
    }

    async fn save_payment_order(&mut self, order: &PaymentOrder) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_orders
            SET status = $2,
                payment_proof_path = $3,
                payment_proof_url = $4,
                transfer_amount = $5,
                transfer_date = $6,
                transfer_notes = $7,
                verified_by = $8,
                verified_at = $9,
                verification_notes = $10,
                rejection_reason = $11,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(order.status)
        .bind(&order.payment_proof_path)
        .bind(&order.payment_proof_url)
        .bind(order.transfer_amount)
        .bind(order.transfer_date)
        .bind(&order.transfer_notes)
        .bind(order.verified_by)
        .bind(order.verified_at)
        .bind(&order.verification_notes)
        .bind(&order.rejection_reason)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        debug!("Ledger transaction rolled back");
        Ok(())
    }
}
