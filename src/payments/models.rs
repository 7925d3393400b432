use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use validator::Validate;

use crate::error::AppError;

pub const ALLOWED_PROOF_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "pdf"];

/// Staff decision on a paid order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyAction {
    Approve,
    Reject,
}

impl FromStr for VerifyAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(VerifyAction::Approve),
            "reject" => Ok(VerifyAction::Reject),
            other => Err(AppError::InvalidAction(format!(
                "Invalid action '{}'. Must be \"approve\" or \"reject\"",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreatePaymentOrderRequest {
    #[validate(range(min = 1, message = "package_id is required"))]
    pub package_id: i64,
    #[validate(length(min = 1, message = "payment_method is required"))]
    pub payment_method: String,
}

/// Proof upload metadata, assembled from the multipart form.
#[derive(Debug, Clone, Default)]
pub struct ProofDetails {
    pub transfer_amount: Option<Decimal>,
    pub transfer_date: Option<DateTime<Utc>>,
    pub transfer_notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct VerifyPaymentRequest {
    /// Parsed by the service so a bad value is reported as an invalid action.
    pub action: String,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentOrdersQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Approved { tokens_credited: i64, balance_after: i64 },
    Rejected,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum VerifyResponseData {
    Approved { tokens_credited: i64 },
    Rejected { status: String },
}

impl From<VerifyOutcome> for VerifyResponseData {
    fn from(outcome: VerifyOutcome) -> Self {
        match outcome {
            VerifyOutcome::Approved { tokens_credited, .. } => {
                VerifyResponseData::Approved { tokens_credited }
            }
            VerifyOutcome::Rejected => VerifyResponseData::Rejected {
                status: "rejected".to_string(),
            },
        }
    }
}
