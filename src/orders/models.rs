use bytes::Bytes;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ledger::models::{Order, OrderStatus};

pub const ALLOWED_DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "pptx", "jpg", "jpeg", "png"];

// ========== REQUEST MODELS ==========

/// An uploaded file, fully buffered.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Bytes,
}

/// Order submission, assembled from the multipart form.
#[derive(Debug, Clone, Validate)]
pub struct SubmitOrderRequest {
    #[validate(length(min = 1, max = 100, message = "documentType is required"))]
    pub document_type: String,
    #[validate(length(min = 1, max = 100, message = "serviceLevel is required"))]
    pub service_level: String,
    #[validate(range(min = 1, max = 100, message = "copies must be between 1 and 100"))]
    pub copies: i32,
    #[validate(length(max = 100))]
    pub binding_type: Option<String>,
    pub color_mode: bool,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub template_id: Option<String>,
    #[validate(range(min = 1, max = 10000))]
    pub page_count: Option<u32>,
}

/// Staff status change
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateOrderStatusRequest {
    #[validate(length(min = 1))]
    pub status: String,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
    #[validate(range(min = 1, max = 100000))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
}

impl ListOrdersQuery {
    pub const DEFAULT_LIMIT: i64 = 20;

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

// ========== RESPONSE MODELS ==========

/// Result of a successful submission, before it is rendered.
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub order: Order,
    pub tokens_remaining: i64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitOrderResponse {
    pub success: bool,
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "dbId")]
    pub db_id: i64,
    pub status: OrderStatus,
    pub tokens_remaining: i64,
    pub warnings: Vec<String>,
}

impl From<SubmittedOrder> for SubmitOrderResponse {
    fn from(submitted: SubmittedOrder) -> Self {
        Self {
            success: true,
            order_id: submitted.order.order_ref,
            db_id: submitted.order.id,
            status: submitted.order.status,
            tokens_remaining: submitted.tokens_remaining,
            warnings: submitted.warnings,
        }
    }
}
