//! In-process ledger store.
//!
//! Mirrors the Postgres semantics the flows rely on: `lock_*` takes a per-row
//! async mutex that is held until the transaction ends, writes are staged and
//! only become visible on commit, and lock waits are bounded by the lock
//! timeout. Used by the test-suite and by `database.backend = "memory"`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::models::*;
use super::store::{LedgerStore, LedgerTx};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    User(i64),
    Order(i64),
    PaymentOrder(i64),
}

#[derive(Default)]
struct Tables {
    users: BTreeMap<i64, User>,
    orders: BTreeMap<i64, Order>,
    payment_orders: BTreeMap<i64, PaymentOrder>,
    transactions: Vec<TokenTransaction>,
    packages: Vec<TokenPackage>,
    payment_methods: Vec<PaymentMethod>,
    user_seq: i64,
    order_seq: i64,
    payment_order_seq: i64,
    transaction_seq: i64,
}

fn next_id(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>,
    dispatch_writes_fail: AtomicBool,
}

#[derive(Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
    lock_timeout: Duration,
}

impl InMemoryLedgerStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            lock_timeout,
        }
    }

    /// Load the default token packages and payment methods.
    pub fn with_default_catalog(self) -> Self {
        {
            let mut tables = self.shared.tables.lock();
            tables.packages = default_packages();
            tables.payment_methods = default_payment_methods();
        }
        self
    }

    /// Create a user directly. User registration lives outside this service.
    pub fn seed_user(&self, token_balance: i64) -> User {
        let mut tables = self.shared.tables.lock();
        let now = Utc::now();
        let user = User {
            id: next_id(&mut tables.user_seq),
            token_balance,
            total_tokens_spent: 0,
            total_tokens_purchased: 0,
            created_at: now,
            updated_at: now,
        };
        tables.users.insert(user.id, user.clone());
        user
    }

    /// Move an order's creation time back, as if it had been sitting for a while.
    #[cfg(test)]
    pub fn backdate_order(&self, order_id: i64, created_at: DateTime<Utc>) {
        if let Some(order) = self.shared.tables.lock().orders.get_mut(&order_id) {
            order.created_at = created_at;
        }
    }

    #[cfg(test)]
    pub fn order_count(&self) -> usize {
        self.shared.tables.lock().orders.len()
    }

    /// Make `mark_dispatched` and `record_dispatch_failure` return errors.
    #[cfg(test)]
    pub fn set_dispatch_writes_failing(&self, failing: bool) {
        self.shared.dispatch_writes_fail.store(failing, Ordering::SeqCst);
    }

    fn check_dispatch_writes(&self) -> AppResult<()> {
        if self.shared.dispatch_writes_fail.load(Ordering::SeqCst) {
            return Err(AppError::Internal("order table unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        Ok(Box::new(InMemoryTx {
            shared: self.shared.clone(),
            lock_timeout: self.lock_timeout,
            guards: HashMap::new(),
            users: HashMap::new(),
            orders: BTreeMap::new(),
            status_changes: BTreeMap::new(),
            payment_orders: BTreeMap::new(),
            transactions: Vec::new(),
        }))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>> {
        Ok(self.shared.tables.lock().users.get(&user_id).cloned())
    }

    async fn get_order(&self, order_id: i64) -> AppResult<Option<Order>> {
        Ok(self.shared.tables.lock().orders.get(&order_id).cloned())
    }

    async fn get_order_by_ref(&self, order_ref: &str) -> AppResult<Option<Order>> {
        let tables = self.shared.tables.lock();
        Ok(tables.orders.values().find(|o| o.order_ref == order_ref).cloned())
    }

    async fn list_orders(&self, filter: &OrderFilter) -> AppResult<(Vec<Order>, i64)> {
        let tables = self.shared.tables.lock();
        let mut matching: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| filter.user_id.map_or(true, |id| o.user_id == id))
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit.max(0) as usize)
            .collect();

        Ok((page, total))
    }

    async fn list_transactions(&self, user_id: i64) -> AppResult<Vec<TokenTransaction>> {
        let tables = self.shared.tables.lock();
        let mut entries: Vec<TokenTransaction> = tables
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by_key(|t| t.id);
        Ok(entries)
    }

    async fn list_recent_transactions(&self, user_id: i64, limit: i64) -> AppResult<Vec<TokenTransaction>> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_payment_order(&self, payment_order_id: i64) -> AppResult<Option<PaymentOrder>> {
        Ok(self.shared.tables.lock().payment_orders.get(&payment_order_id).cloned())
    }

    async fn list_payment_orders(&self, filter: &PaymentOrderFilter) -> AppResult<Vec<PaymentOrder>> {
        let tables = self.shared.tables.lock();
        let mut orders: Vec<PaymentOrder> = tables
            .payment_orders
            .values()
            .filter(|o| filter.user_id.map_or(true, |id| o.user_id == id))
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(orders)
    }

    async fn list_packages(&self) -> AppResult<Vec<TokenPackage>> {
        let tables = self.shared.tables.lock();
        Ok(tables.packages.iter().filter(|p| p.is_active).cloned().collect())
    }

    async fn get_package(&self, package_id: i64) -> AppResult<Option<TokenPackage>> {
        let tables = self.shared.tables.lock();
        Ok(tables.packages.iter().find(|p| p.id == package_id).cloned())
    }

    async fn list_payment_methods(&self) -> AppResult<Vec<PaymentMethod>> {
        let tables = self.shared.tables.lock();
        Ok(tables.payment_methods.iter().filter(|m| m.is_active).cloned().collect())
    }

    async fn mark_dispatched(&self, order_id: i64) -> AppResult<()> {
        self.check_dispatch_writes()?;
        let mut tables = self.shared.tables.lock();
        if let Some(order) = tables.orders.get_mut(&order_id) {
            let now = Utc::now();
            order.dispatched_at = Some(now);
            order.dispatch_attempts += 1;
            order.updated_at = now;
        }
        Ok(())
    }

    async fn record_dispatch_failure(&self, order_id: i64) -> AppResult<()> {
        self.check_dispatch_writes()?;
        let mut tables = self.shared.tables.lock();
        if let Some(order) = tables.orders.get_mut(&order_id) {
            order.dispatch_attempts += 1;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_undispatched_orders(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Order>> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Processing
                    && o.dispatched_at.is_none()
                    && o.created_at < older_than
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// Staged writes plus the row locks held by one transaction.
pub struct InMemoryTx {
    shared: Arc<Shared>,
    lock_timeout: Duration,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
    users: HashMap<i64, User>,
    orders: BTreeMap<i64, Order>,
    status_changes: BTreeMap<i64, StatusChange>,
    payment_orders: BTreeMap<i64, PaymentOrder>,
    transactions: Vec<TokenTransaction>,
}

/// Staged staff update of an existing order. Only these columns are written
/// back on commit, so dispatch bookkeeping done meanwhile survives.
struct StatusChange {
    status: OrderStatus,
    staff_notes: Option<String>,
    updated_at: DateTime<Utc>,
}

impl StatusChange {
    fn apply(&self, order: &mut Order) {
        order.status = self.status;
        if let Some(notes) = &self.staff_notes {
            order.staff_notes = Some(notes.clone());
        }
        order.updated_at = self.updated_at;
    }
}

impl InMemoryTx {
    async fn acquire(&mut self, key: RowKey) -> AppResult<()> {
        if self.guards.contains_key(&key) {
            return Ok(());
        }

        let lock = {
            let mut locks = self.shared.row_locks.lock();
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| AppError::Timeout)?;
        self.guards.insert(key, guard);
        Ok(())
    }

    fn holds(&self, key: RowKey) -> bool {
        self.guards.contains_key(&key)
    }

    fn read_user(&self, user_id: i64) -> Option<User> {
        self.users
            .get(&user_id)
            .cloned()
            .or_else(|| self.shared.tables.lock().users.get(&user_id).cloned())
    }

    fn read_order(&self, order_id: i64) -> Option<Order> {
        let mut order = self
            .orders
            .get(&order_id)
            .cloned()
            .or_else(|| self.shared.tables.lock().orders.get(&order_id).cloned())?;
        if let Some(change) = self.status_changes.get(&order_id) {
            change.apply(&mut order);
        }
        Some(order)
    }

    fn read_payment_order(&self, payment_order_id: i64) -> Option<PaymentOrder> {
        self.payment_orders
            .get(&payment_order_id)
            .cloned()
            .or_else(|| {
                self.shared
                    .tables
                    .lock()
                    .payment_orders
                    .get(&payment_order_id)
                    .cloned()
            })
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_user(&mut self, user_id: i64) -> AppResult<Option<User>> {
        if self.read_user(user_id).is_none() {
            return Ok(None);
        }
        self.acquire(RowKey::User(user_id)).await?;
        // Re-read: the row may have changed while we waited for the lock.
        Ok(self.read_user(user_id))
    }

    async fn write_balance(&mut self, update: BalanceUpdate) -> AppResult<()> {
        if !self.holds(RowKey::User(update.user_id)) {
            return Err(AppError::Internal(format!(
                "balance write for user {} without holding its row lock",
                update.user_id
            )));
        }
        if update.token_balance < 0 {
            return Err(AppError::Internal(format!(
                "negative balance for user {}",
                update.user_id
            )));
        }

        let mut user = self
            .read_user(update.user_id)
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", update.user_id)))?;
        user.token_balance = update.token_balance;
        user.total_tokens_spent = update.total_tokens_spent;
        user.total_tokens_purchased = update.total_tokens_purchased;
        user.updated_at = Utc::now();
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn append_transaction(&mut self, entry: NewTokenTransaction) -> AppResult<TokenTransaction> {
        let id = next_id(&mut self.shared.tables.lock().transaction_seq);
        let transaction = TokenTransaction {
            id,
            user_id: entry.user_id,
            amount: entry.amount,
            balance_before: entry.balance_before,
            balance_after: entry.balance_after,
            transaction_type: entry.transaction_type,
            description: entry.description,
            order_id: entry.order_id,
            payment_order_id: entry.payment_order_id,
            created_at: Utc::now(),
        };
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn reserve_order_id(&mut self) -> AppResult<i64> {
        Ok(next_id(&mut self.shared.tables.lock().order_seq))
    }

    async fn insert_order(&mut self, order: NewOrder) -> AppResult<Order> {
        if self.read_user(order.user_id).is_none() {
            return Err(AppError::NotFound(format!("User {} not found", order.user_id)));
        }
        let duplicate_ref = self.orders.values().any(|o| o.order_ref == order.order_ref)
            || self
                .shared
                .tables
                .lock()
                .orders
                .values()
                .any(|o| o.order_ref == order.order_ref);
        if duplicate_ref {
            return Err(AppError::Internal(format!(
                "duplicate order reference {}",
                order.order_ref
            )));
        }

        let now = Utc::now();
        let order = Order {
            id: order.id,
            order_ref: order.order_ref,
            user_id: order.user_id,
            status: OrderStatus::Processing,
            original_filename: order.original_filename,
            file_path: order.file_path,
            document_type: order.document_type,
            template_id: order.template_id,
            service_level: order.service_level,
            copies: order.copies,
            binding_type: order.binding_type,
            color_mode: order.color_mode,
            notes: order.notes,
            staff_notes: None,
            tokens_required: order.tokens_required,
            tokens_spent: order.tokens_spent,
            dispatched_at: None,
            dispatch_attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn lock_order_by_ref(&mut self, order_ref: &str) -> AppResult<Option<Order>> {
        let order_id = self
            .orders
            .values()
            .find(|o| o.order_ref == order_ref)
            .map(|o| o.id)
            .or_else(|| {
                self.shared
                    .tables
                    .lock()
                    .orders
                    .values()
                    .find(|o| o.order_ref == order_ref)
                    .map(|o| o.id)
            });

        match order_id {
            Some(id) => {
                self.acquire(RowKey::Order(id)).await?;
                Ok(self.read_order(id))
            }
            None => Ok(None),
        }
    }

    async fn update_order_status(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        staff_notes: Option<String>,
    ) -> AppResult<Order> {
        let mut order = self
            .read_order(order_id)
            .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_id)))?;
        let change = StatusChange {
            status,
            staff_notes: staff_notes.or_else(|| {
                self.status_changes
                    .get(&order_id)
                    .and_then(|c| c.staff_notes.clone())
            }),
            updated_at: Utc::now(),
        };
        change.apply(&mut order);
        self.status_changes.insert(order_id, change);
        Ok(order)
    }

    async fn insert_payment_order(&mut self, order: NewPaymentOrder) -> AppResult<PaymentOrder> {
        if self.read_user(order.user_id).is_none() {
            return Err(AppError::NotFound(format!("User {} not found", order.user_id)));
        }

        let id = next_id(&mut self.shared.tables.lock().payment_order_seq);
        let now = Utc::now();
        let order = PaymentOrder {
            id,
            order_number: order.order_number,
            user_id: order.user_id,
            package_id: order.package_id,
            token_amount: order.token_amount,
            bonus_tokens: order.bonus_tokens,
            total_tokens: order.total_tokens,
            price: order.price,
            payment_method: order.payment_method,
            status: PaymentStatus::Pending,
            payment_proof_path: None,
            payment_proof_url: None,
            transfer_amount: None,
            transfer_date: None,
            transfer_notes: None,
            verified_by: None,
            verified_at: None,
            verification_notes: None,
            rejection_reason: None,
            expires_at: order.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.payment_orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn lock_payment_order(&mut self, payment_order_id: i64) -> AppResult<Option<PaymentOrder>> {
        if self.read_payment_order(payment_order_id).is_none() {
            return Ok(None);
        }
        self.acquire(RowKey::PaymentOrder(payment_order_id)).await?;
        Ok(self.read_payment_order(payment_order_id))
    }

    async fn save_payment_order(&mut self, order: &PaymentOrder) -> AppResult<()> {
        if !self.holds(RowKey::PaymentOrder(order.id)) && !self.payment_orders.contains_key(&order.id) {
            return Err(AppError::Internal(format!(
                "payment order {} saved without holding its row lock",
                order.id
            )));
        }
        let mut order = order.clone();
        order.updated_at = Utc::now();
        self.payment_orders.insert(order.id, order);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let this = *self;
        {
            let mut tables = this.shared.tables.lock();
            tables.users.extend(this.users);
            tables.orders.extend(this.orders);
            for (order_id, change) in &this.status_changes {
                if let Some(order) = tables.orders.get_mut(order_id) {
                    change.apply(order);
                }
            }
            tables.payment_orders.extend(this.payment_orders);
            tables.transactions.extend(this.transactions);
        }
        // Row locks are released here, after the writes are visible.
        drop(this.guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}

fn default_packages() -> Vec<TokenPackage> {
    vec![
        TokenPackage {
            id: 1,
            name: "Starter Pack".to_string(),
            token_amount: 10,
            bonus_tokens: 0,
            price: dec!(10000),
            original_price: None,
            discount_percentage: 0,
            valid_days: Some(90),
            is_popular: false,
            description: "Perfect for trying out the service".to_string(),
            is_active: true,
        },
        TokenPackage {
            id: 2,
            name: "Student Pack".to_string(),
            token_amount: 50,
            bonus_tokens: 5,
            price: dec!(40000),
            original_price: Some(dec!(50000)),
            discount_percentage: 20,
            valid_days: Some(180),
            is_popular: true,
            description: "Most popular! Great for 1 skripsi + revisions".to_string(),
            is_active: true,
        },
        TokenPackage {
            id: 3,
            name: "Pro Pack".to_string(),
            token_amount: 100,
            bonus_tokens: 15,
            price: dec!(70000),
            original_price: Some(dec!(100000)),
            discount_percentage: 30,
            valid_days: Some(365),
            is_popular: false,
            description: "Best value for multiple documents".to_string(),
            is_active: true,
        },
        TokenPackage {
            id: 4,
            name: "Mega Pack".to_string(),
            token_amount: 300,
            bonus_tokens: 50,
            price: dec!(180000),
            original_price: Some(dec!(300000)),
            discount_percentage: 40,
            valid_days: None,
            is_popular: false,
            description: "For power users and resellers".to_string(),
            is_active: true,
        },
    ]
}

fn default_payment_methods() -> Vec<PaymentMethod> {
    let bank = |id: i64, bank_name: &str, account_number: &str| PaymentMethod {
        id,
        method_type: PaymentMethodType::BankTransfer,
        bank_name: Some(bank_name.to_string()),
        account_number: Some(account_number.to_string()),
        account_name: Some("SmartCopy Print".to_string()),
        qris_merchant_name: None,
        qris_image_url: None,
        instructions: format!("Transfer ke rekening {}, lalu upload bukti transfer", bank_name),
        is_active: true,
    };

    vec![
        bank(1, "BCA", "1234567890"),
        bank(2, "Mandiri", "0987654321"),
        PaymentMethod {
            id: 3,
            method_type: PaymentMethodType::Qris,
            bank_name: None,
            account_number: None,
            account_name: None,
            qris_merchant_name: Some("SmartCopy Toko".to_string()),
            qris_image_url: Some("/static/qris-smartcopy.png".to_string()),
            instructions: "Scan QRIS dan upload bukti pembayaran".to_string(),
            is_active: true,
        },
        PaymentMethod {
            id: 4,
            method_type: PaymentMethodType::Cash,
            bank_name: None,
            account_number: None,
            account_name: None,
            qris_merchant_name: None,
            qris_image_url: None,
            instructions: "Datang ke toko SmartCopy di Jl. Contoh No. 123".to_string(),
            is_active: true,
        },
    ]
}
