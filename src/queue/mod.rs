//! Hand-off of format jobs to the external formatting worker.
//!
//! The worker pops JSON job descriptors off a shared FIFO list. Enqueue is
//! fire-and-forget: a failure here never unwinds a committed order, the
//! order is left undispatched for the reconciler instead.

pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::QueueError;
use crate::ledger::models::Order;

pub use memory::InMemoryJobQueue;
pub use redis_queue::RedisJobQueue;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), QueueError>;

    /// Number of descriptors waiting in the list.
    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Wire format consumed by the formatting worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub id: String,
    pub order_ref: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub input: String,
    #[serde(rename = "ref")]
    pub format_ref: String,
    pub output: String,
    pub user_id: i64,
}

impl JobDescriptor {
    pub const FORMAT: &'static str = "format";

    /// Descriptor for formatting an order's uploaded document.
    ///
    /// A chosen template wins over the generic document-type category.
    pub fn format_order(order: &Order, output_dir: &Path) -> Self {
        let format_ref = match order.template_id.as_deref() {
            Some(template) if !template.trim().is_empty() => format!("TEMPLATE:{}", template),
            _ => format!("CATEGORY:{}", order.document_type),
        };
        let output = output_dir
            .join(format!("{}_formatted.docx", order.order_ref))
            .to_string_lossy()
            .into_owned();

        Self {
            id: order.id.to_string(),
            order_ref: order.order_ref.clone(),
            job_type: Self::FORMAT.to_string(),
            input: order.file_path.clone(),
            format_ref,
            output,
            user_id: order.user_id,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::models::OrderStatus;
    use chrono::Utc;

    pub(crate) fn sample_order(template_id: Option<&str>) -> Order {
        let now = Utc::now();
        Order {
            id: 42,
            order_ref: "ORD-20260101-ABCD".to_string(),
            user_id: 7,
            status: OrderStatus::Processing,
            original_filename: "skripsi.docx".to_string(),
            file_path: "storage/uploads/3f1c.docx".to_string(),
            document_type: "skripsi".to_string(),
            template_id: template_id.map(str::to_string),
            service_level: "standard".to_string(),
            copies: 1,
            binding_type: None,
            color_mode: false,
            notes: None,
            staff_notes: None,
            tokens_required: 1,
            tokens_spent: 1,
            dispatched_at: None,
            dispatch_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_descriptor_wire_format() {
        let job = JobDescriptor::format_order(&sample_order(None), Path::new("storage/outputs"));
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "id": "42",
                "orderRef": "ORD-20260101-ABCD",
                "type": "format",
                "input": "storage/uploads/3f1c.docx",
                "ref": "CATEGORY:skripsi",
                "output": "storage/outputs/ORD-20260101-ABCD_formatted.docx",
                "userId": 7
            })
        );
    }

    #[test]
    fn test_template_takes_precedence_over_category() {
        let job = JobDescriptor::format_order(&sample_order(Some("apa-7")), Path::new("out"));
        assert_eq!(job.format_ref, "TEMPLATE:apa-7");

        let blank = JobDescriptor::format_order(&sample_order(Some("  ")), Path::new("out"));
        assert_eq!(blank.format_ref, "CATEGORY:skripsi");
    }
}
