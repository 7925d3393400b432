use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use super::models::*;
use crate::api::handler::AppState;
use crate::api::models::ApiResponse;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{PaymentMethod, PaymentOrder, TokenPackage};
use crate::middleware::{CallerId, StaffId, ValidatedJson};
use crate::orders::models::UploadedFile;

/// GET /api/packages
pub async fn list_packages(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<TokenPackage>>>> {
    Ok(Json(ApiResponse::ok(state.payments.list_packages().await?)))
}

/// GET /api/payment-methods
pub async fn list_payment_methods(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<PaymentMethod>>>> {
    Ok(Json(ApiResponse::ok(state.payments.list_payment_methods().await?)))
}

/// POST /api/payment-orders
pub async fn create_payment_order(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    ValidatedJson(request): ValidatedJson<CreatePaymentOrderRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<PaymentOrder>>)> {
    let order = state.payments.create_order(user_id, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(order))))
}

/// POST /api/payment-orders/:id/proof (multipart, file field `proof`)
pub async fn upload_proof(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(payment_order_id): Path<i64>,
    multipart: Multipart,
) -> AppResult<Json<ApiResponse<PaymentOrder>>> {
    let (file, details) = parse_proof_form(multipart).await?;
    let order = state
        .payments
        .upload_proof(payment_order_id, user_id, file, details)
        .await?;
    Ok(Json(ApiResponse::ok(order)))
}

/// GET /api/my-payments
pub async fn list_my_payments(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Query(query): Query<PaymentOrdersQuery>,
) -> AppResult<Json<ApiResponse<Vec<PaymentOrder>>>> {
    let orders = state
        .payments
        .list_user_orders(user_id, query.status.as_deref())
        .await?;
    Ok(Json(ApiResponse::ok(orders)))
}

/// GET /api/admin/pending-payments (staff)
pub async fn list_pending_payments(
    State(state): State<AppState>,
    StaffId(_staff_id): StaffId,
) -> AppResult<Json<ApiResponse<Vec<PaymentOrder>>>> {
    Ok(Json(ApiResponse::ok(state.payments.list_pending().await?)))
}

/// POST /api/admin/payments/:id/verify (staff)
pub async fn verify_payment(
    State(state): State<AppState>,
    StaffId(staff_id): StaffId,
    Path(payment_order_id): Path<i64>,
    ValidatedJson(request): ValidatedJson<VerifyPaymentRequest>,
) -> AppResult<Json<ApiResponse<VerifyResponseData>>> {
    let outcome = state
        .payments
        .verify(payment_order_id, request, staff_id)
        .await?;
    Ok(Json(ApiResponse::ok(outcome.into())))
}

async fn parse_proof_form(mut multipart: Multipart) -> AppResult<(UploadedFile, ProofDetails)> {
    let mut file = None;
    let mut details = ProofDetails::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == "proof" {
            let filename = field
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| AppError::Validation("proof field has no filename".to_string()))?;
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::Validation(format!("Failed to read upload: {}", e)))?;
            file = Some(UploadedFile { filename, bytes });
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::Validation(format!("Failed to read field {}: {}", name, e)))?;
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match name.as_str() {
            "transfer_amount" => {
                let amount = Decimal::from_str(value).map_err(|_| {
                    AppError::Validation(format!("Invalid transfer_amount: {}", value))
                })?;
                if amount.is_sign_negative() {
                    return Err(AppError::Validation("transfer_amount must not be negative".to_string()));
                }
                details.transfer_amount = Some(amount);
            }
            "transfer_date" => details.transfer_date = Some(parse_transfer_date(value)?),
            "transfer_notes" => details.transfer_notes = Some(value.to_string()),
            other => {
                return Err(AppError::Validation(format!("Unknown field: {}", other)));
            }
        }
    }

    let file = file.ok_or_else(|| AppError::Validation("Payment proof file is required".to_string()))?;
    Ok((file, details))
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
fn parse_transfer_date(value: &str) -> AppResult<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| AppError::Validation(format!("Invalid transfer_date: {}", value)))
}
