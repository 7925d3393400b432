use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Order lifecycle.
/// `processing` is set at submission; the remaining states are driven by
/// staff or the formatting worker's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Processing,
    PendingReview,
    InProgress,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Processing => "processing",
            OrderStatus::PendingReview => "pending_review",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// States staff may move an order into by hand.
    pub fn is_staff_target(&self) -> bool {
        !matches!(self, OrderStatus::Processing)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = AppError;

    /// Accepts both `in_progress` and the legacy upper-case `IN_PROGRESS` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "processing" => Ok(OrderStatus::Processing),
            "pending_review" => Ok(OrderStatus::PendingReview),
            "in_progress" => Ok(OrderStatus::InProgress),
            "ready" => Ok(OrderStatus::Ready),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(AppError::Validation(format!("Invalid order status: {}", other))),
        }
    }
}

/// Payment order status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Completed,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "completed" => Ok(PaymentStatus::Completed),
            "rejected" => Ok(PaymentStatus::Rejected),
            other => Err(AppError::Validation(format!("Invalid payment status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    SpendFormat,
    Purchase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_method_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodType {
    BankTransfer,
    Qris,
    Cash,
}

impl FromStr for PaymentMethodType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bank_transfer" => Ok(PaymentMethodType::BankTransfer),
            "qris" => Ok(PaymentMethodType::Qris),
            "cash" => Ok(PaymentMethodType::Cash),
            other => Err(AppError::Validation(format!("Unknown payment method: {}", other))),
        }
    }
}

/// User entity. The balance columns are only ever written by the token ledger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub token_balance: i64,
    pub total_tokens_spent: i64,
    pub total_tokens_purchased: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New balance figures for a locked user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub user_id: i64,
    pub token_balance: i64,
    pub total_tokens_spent: i64,
    pub total_tokens_purchased: i64,
}

/// Print/format order
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub order_ref: String,
    pub user_id: i64,
    pub status: OrderStatus,
    pub original_filename: String,
    pub file_path: String,
    pub document_type: String,
    pub template_id: Option<String>,
    pub service_level: String,
    pub copies: i32,
    pub binding_type: Option<String>,
    pub color_mode: bool,
    pub notes: Option<String>,
    pub staff_notes: Option<String>,
    pub tokens_required: i64,
    pub tokens_spent: i64,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dispatch_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Pre-reserved primary key so the ledger entry can reference the order
    /// before the row itself is written.
    pub id: i64,
    pub order_ref: String,
    pub user_id: i64,
    pub original_filename: String,
    pub file_path: String,
    pub document_type: String,
    pub template_id: Option<String>,
    pub service_level: String,
    pub copies: i32,
    pub binding_type: Option<String>,
    pub color_mode: bool,
    pub notes: Option<String>,
    pub tokens_required: i64,
    pub tokens_spent: i64,
}

/// Token purchase order
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentOrder {
    pub id: i64,
    pub order_number: String,
    pub user_id: i64,
    pub package_id: i64,
    pub token_amount: i64,
    pub bonus_tokens: i64,
    pub total_tokens: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub payment_method: PaymentMethodType,
    pub status: PaymentStatus,
    pub payment_proof_path: Option<String>,
    pub payment_proof_url: Option<String>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub transfer_amount: Option<Decimal>,
    pub transfer_date: Option<DateTime<Utc>>,
    pub transfer_notes: Option<String>,
    pub verified_by: Option<i64>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentOrder {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentOrder {
    pub order_number: String,
    pub user_id: i64,
    pub package_id: i64,
    pub token_amount: i64,
    pub bonus_tokens: i64,
    pub total_tokens: i64,
    pub price: Decimal,
    pub payment_method: PaymentMethodType,
    pub expires_at: DateTime<Utc>,
}

/// Append-only ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenTransaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub transaction_type: TransactionType,
    pub description: String,
    pub order_id: Option<i64>,
    pub payment_order_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTokenTransaction {
    pub user_id: i64,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub transaction_type: TransactionType,
    pub description: String,
    pub order_id: Option<i64>,
    pub payment_order_id: Option<i64>,
}

/// Purchasable token bundle
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenPackage {
    pub id: i64,
    pub name: String,
    pub token_amount: i64,
    pub bonus_tokens: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub original_price: Option<Decimal>,
    pub discount_percentage: i32,
    pub valid_days: Option<i32>,
    pub is_popular: bool,
    pub description: String,
    pub is_active: bool,
}

impl TokenPackage {
    pub fn total_tokens(&self) -> i64 {
        self.token_amount + self.bonus_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentMethod {
    pub id: i64,
    pub method_type: PaymentMethodType,
    pub bank_name: Option<String>,
    pub account_number: Option<String>,
    pub account_name: Option<String>,
    pub qris_merchant_name: Option<String>,
    pub qris_image_url: Option<String>,
    pub instructions: String,
    pub is_active: bool,
}

/// Filter for order listings
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub user_id: Option<i64>,
    pub status: Option<OrderStatus>,
    pub page: i64,
    pub limit: i64,
}

impl OrderFilter {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1).saturating_mul(self.limit.max(0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaymentOrderFilter {
    pub user_id: Option<i64>,
    pub status: Option<PaymentStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_parsing_accepts_legacy_casing() {
        assert_eq!("IN_PROGRESS".parse::<OrderStatus>().unwrap(), OrderStatus::InProgress);
        assert_eq!("pending_review".parse::<OrderStatus>().unwrap(), OrderStatus::PendingReview);
        assert!("shipped".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Ready.is_terminal());
        assert!(!OrderStatus::Processing.is_staff_target());
    }

    #[test]
    fn test_order_filter_offset() {
        let filter = OrderFilter { page: 3, limit: 10, ..Default::default() };
        assert_eq!(filter.offset(), 20);

        let far = OrderFilter { page: i64::MAX, limit: 20, ..Default::default() };
        assert_eq!(far.offset(), i64::MAX);

        let first = OrderFilter { page: 0, limit: 10, ..Default::default() };
        assert_eq!(first.offset(), 0);
    }
}
