use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::*;
use super::store::{LedgerStore, LedgerTx};
use crate::error::{AppError, AppResult};

/// Token ledger engine.
///
/// All balance mutation goes through [`TokenLedger::debit`] and
/// [`TokenLedger::credit`]. Both lock the user row inside the caller's
/// transaction, compute the new figures from that single locked read, write
/// them back, and append the matching ledger entry, so `balance_before` /
/// `balance_after` can never disagree with the stored balance under
/// concurrent callers.
pub struct TokenLedger {
    store: Arc<dyn LedgerStore>,
}

/// Outcome of a balance mutation.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub transaction: TokenTransaction,
    pub balance_after: i64,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Spend `amount` tokens for a format order.
    ///
    /// Fails with `InsufficientBalance` without touching anything when the
    /// locked balance is short; the caller is expected to roll back.
    pub async fn debit(
        tx: &mut dyn LedgerTx,
        user_id: i64,
        amount: i64,
        reason: &str,
        order_id: Option<i64>,
    ) -> AppResult<LedgerEntry> {
        if amount <= 0 {
            return Err(AppError::Validation(format!(
                "Debit amount must be positive, got {}",
                amount
            )));
        }

        let user = tx
            .lock_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        if user.token_balance < amount {
            warn!(
                user_id,
                required = amount,
                available = user.token_balance,
                "Debit refused: insufficient balance"
            );
            return Err(AppError::InsufficientBalance {
                required: amount,
                available: user.token_balance,
            });
        }

        let balance_before = user.token_balance;
        let balance_after = balance_before - amount;

        tx.write_balance(BalanceUpdate {
            user_id,
            token_balance: balance_after,
            total_tokens_spent: user.total_tokens_spent + amount,
            total_tokens_purchased: user.total_tokens_purchased,
        })
        .await?;

        let transaction = tx
            .append_transaction(NewTokenTransaction {
                user_id,
                amount: -amount,
                balance_before,
                balance_after,
                transaction_type: TransactionType::SpendFormat,
                description: reason.to_string(),
                order_id,
                payment_order_id: None,
            })
            .await?;

        info!(user_id, amount, balance_before, balance_after, "Tokens debited");

        Ok(LedgerEntry {
            transaction,
            balance_after,
        })
    }

    /// Credit `amount` purchased tokens. No upper bound on the balance.
    pub async fn credit(
        tx: &mut dyn LedgerTx,
        user_id: i64,
        amount: i64,
        reason: &str,
        payment_order_id: Option<i64>,
    ) -> AppResult<LedgerEntry> {
        if amount <= 0 {
            return Err(AppError::Validation(format!(
                "Credit amount must be positive, got {}",
                amount
            )));
        }

        let user = tx
            .lock_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        let balance_before = user.token_balance;
        let balance_after = balance_before
            .checked_add(amount)
            .ok_or_else(|| AppError::Internal(format!("balance overflow for user {}", user_id)))?;

        tx.write_balance(BalanceUpdate {
            user_id,
            token_balance: balance_after,
            total_tokens_spent: user.total_tokens_spent,
            total_tokens_purchased: user.total_tokens_purchased + amount,
        })
        .await?;

        let transaction = tx
            .append_transaction(NewTokenTransaction {
                user_id,
                amount,
                balance_before,
                balance_after,
                transaction_type: TransactionType::Purchase,
                description: reason.to_string(),
                order_id: None,
                payment_order_id,
            })
            .await?;

        info!(user_id, amount, balance_before, balance_after, "Tokens credited");

        Ok(LedgerEntry {
            transaction,
            balance_after,
        })
    }

    /// Replay a user's ledger and compare it with the stored balance.
    pub async fn audit(&self, user_id: i64) -> AppResult<AuditReport> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;
        let entries = self.store.list_transactions(user_id).await?;

        let report = AuditReport::build(&user, &entries);
        if !report.consistent {
            warn!(user_id, violations = ?report.violations, "Ledger audit found inconsistencies");
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub user_id: i64,
    pub entries: usize,
    pub opening_balance: i64,
    pub replayed_balance: i64,
    pub stored_balance: i64,
    pub consistent: bool,
    pub violations: Vec<String>,
}

impl AuditReport {
    /// `entries` must be in creation order.
    pub fn build(user: &User, entries: &[TokenTransaction]) -> Self {
        let opening_balance = entries
            .first()
            .map(|e| e.balance_before)
            .unwrap_or(user.token_balance);

        let mut violations = Vec::new();
        let mut running = opening_balance;

        for entry in entries {
            if entry.balance_before != running {
                violations.push(format!(
                    "transaction {}: balance_before {} does not continue from {}",
                    entry.id, entry.balance_before, running
                ));
            }
            if entry.balance_before + entry.amount != entry.balance_after {
                violations.push(format!(
                    "transaction {}: {} + {} != {}",
                    entry.id, entry.balance_before, entry.amount, entry.balance_after
                ));
            }
            if entry.balance_after < 0 {
                violations.push(format!("transaction {}: negative balance", entry.id));
            }
            running += entry.amount;
        }

        if running != user.token_balance {
            violations.push(format!(
                "replayed balance {} differs from stored balance {}",
                running, user.token_balance
            ));
        }

        Self {
            user_id: user.id,
            entries: entries.len(),
            opening_balance,
            replayed_balance: running,
            stored_balance: user.token_balance,
            consistent: violations.is_empty(),
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedgerStore;
    use std::time::Duration;

    fn store() -> Arc<InMemoryLedgerStore> {
        Arc::new(InMemoryLedgerStore::new(Duration::from_millis(500)))
    }

    #[tokio::test]
    async fn test_debit_captures_locked_balances() {
        let store = store();
        let user = store.seed_user(5);

        let mut tx = store.begin().await.unwrap();
        let entry = TokenLedger::debit(tx.as_mut(), user.id, 1, "Format order ORD-1", None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(entry.balance_after, 4);
        assert_eq!(entry.transaction.amount, -1);
        assert_eq!(entry.transaction.balance_before, 5);
        assert_eq!(entry.transaction.balance_after, 4);
        assert_eq!(entry.transaction.transaction_type, TransactionType::SpendFormat);

        let stored = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.token_balance, 4);
        assert_eq!(stored.total_tokens_spent, 1);
    }

    #[tokio::test]
    async fn test_debit_rejects_overdraft_without_writes() {
        let store = store();
        let user = store.seed_user(0);

        let mut tx = store.begin().await.unwrap();
        let result = TokenLedger::debit(tx.as_mut(), user.id, 1, "Format order", None).await;
        assert!(matches!(
            result,
            Err(AppError::InsufficientBalance { required: 1, available: 0 })
        ));
        tx.rollback().await.unwrap();

        assert!(store.list_transactions(user.id).await.unwrap().is_empty());
        assert_eq!(store.get_user(user.id).await.unwrap().unwrap().token_balance, 0);
    }

    #[tokio::test]
    async fn test_non_positive_amounts_are_rejected() {
        let store = store();
        let user = store.seed_user(3);

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            TokenLedger::debit(tx.as_mut(), user.id, 0, "noop", None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            TokenLedger::credit(tx.as_mut(), user.id, -5, "noop", None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let store = store();

        let mut tx = store.begin().await.unwrap();
        let result = TokenLedger::credit(tx.as_mut(), 404, 10, "Token purchase", None).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_serialize_on_the_user_row() {
        let store = store();
        let user_id = store.seed_user(1).id;

        let attempt = move |store: Arc<InMemoryLedgerStore>| async move {
            let mut tx = store.begin().await?;
            let entry = TokenLedger::debit(tx.as_mut(), user_id, 1, "Format order", None).await?;
            // Hold the lock across a yield so the other caller has to wait.
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.commit().await?;
            Ok::<_, AppError>(entry)
        };

        let (a, b) = tokio::join!(
            tokio::spawn(attempt(store.clone())),
            tokio::spawn(attempt(store.clone()))
        );
        let results = [a.unwrap(), b.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let refusals = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::InsufficientBalance { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(refusals, 1);
        assert_eq!(store.get_user(user_id).await.unwrap().unwrap().token_balance, 0);
        assert_eq!(store.list_transactions(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_mutations_keep_the_ledger_replayable() {
        let store = store();
        let user_id = store.seed_user(10).id;

        let mut handles = Vec::new();
        for i in 0..20i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut tx = store.begin().await?;
                let result = if i % 3 == 0 {
                    TokenLedger::credit(tx.as_mut(), user_id, 2, "Token purchase", None).await
                } else {
                    TokenLedger::debit(tx.as_mut(), user_id, 1, "Format order", None).await
                };
                match result {
                    Ok(_) => tx.commit().await,
                    Err(e) => {
                        tx.rollback().await?;
                        Err(e)
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        let ledger = TokenLedger::new(store.clone());
        let report = ledger.audit(user_id).await.unwrap();
        assert!(report.consistent, "{:?}", report.violations);
        assert_eq!(report.opening_balance, 10);

        let entries = store.list_transactions(user_id).await.unwrap();
        let signed_sum: i64 = entries.iter().map(|e| e.amount).sum();
        let stored = store.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(stored.token_balance, 10 + signed_sum);
        assert!(stored.token_balance >= 0);
    }

    #[test]
    fn test_audit_detects_broken_chain() {
        let now = chrono::Utc::now();
        let user = User {
            id: 7,
            token_balance: 9,
            total_tokens_spent: 1,
            total_tokens_purchased: 0,
            created_at: now,
            updated_at: now,
        };
        let entry = |id, before, amount, after| TokenTransaction {
            id,
            user_id: 7,
            amount,
            balance_before: before,
            balance_after: after,
            transaction_type: TransactionType::SpendFormat,
            description: String::new(),
            order_id: None,
            payment_order_id: None,
            created_at: now,
        };

        let report = AuditReport::build(&user, &[entry(1, 10, -1, 9), entry(2, 8, -1, 7)]);
        assert!(!report.consistent);
        assert_eq!(report.violations.len(), 2);

        let clean = AuditReport::build(&user, &[entry(1, 10, -1, 9)]);
        assert!(clean.consistent);
        assert_eq!(clean.replayed_balance, 9);
    }
}
