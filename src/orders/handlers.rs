use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use super::models::*;
use crate::api::handler::AppState;
use crate::api::models::{ApiResponse, PaginatedResponse, Pagination};
use crate::error::{AppError, AppResult};
use crate::ledger::models::Order;
use crate::middleware::{CallerId, StaffId, ValidatedJson};

/// POST /api/orders (multipart)
pub async fn submit_order(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<SubmitOrderResponse>)> {
    let (file, request) = parse_order_form(multipart).await?;
    info!(user_id, filename = %file.filename, size = file.bytes.len(), "Order submission received");

    let submitted = state.orders.submit(user_id, file, request).await?;
    Ok((StatusCode::CREATED, Json(submitted.into())))
}

/// GET /api/orders/:order_ref
///
/// Staff see any order; customers only their own.
pub async fn get_order(
    State(state): State<AppState>,
    staff: Option<StaffId>,
    caller: Option<CallerId>,
    Path(order_ref): Path<String>,
) -> AppResult<Json<ApiResponse<Order>>> {
    let order = state.orders.get(&order_ref).await?;

    match (staff, caller) {
        (Some(_), _) => Ok(Json(ApiResponse::ok(order))),
        (None, Some(CallerId(user_id))) if order.user_id == user_id => {
            Ok(Json(ApiResponse::ok(order)))
        }
        (None, Some(_)) => Err(AppError::NotFound(format!("Order {} not found", order_ref))),
        (None, None) => Err(AppError::Unauthorized),
    }
}

/// GET /api/orders (staff)
pub async fn list_orders(
    State(state): State<AppState>,
    StaffId(_staff_id): StaffId,
    Query(query): Query<ListOrdersQuery>,
) -> AppResult<Json<PaginatedResponse<Order>>> {
    let (orders, total) = state.orders.list(&query).await?;
    Ok(Json(PaginatedResponse {
        success: true,
        data: orders,
        pagination: Pagination::new(query.page(), query.limit(), total),
    }))
}

/// GET /api/my-orders
pub async fn list_my_orders(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Query(query): Query<ListOrdersQuery>,
) -> AppResult<Json<PaginatedResponse<Order>>> {
    let (orders, total) = state.orders.list_user(user_id, &query).await?;
    Ok(Json(PaginatedResponse {
        success: true,
        data: orders,
        pagination: Pagination::new(query.page(), query.limit(), total),
    }))
}

/// PATCH /api/orders/:order_ref/status (staff)
pub async fn update_order_status(
    State(state): State<AppState>,
    StaffId(staff_id): StaffId,
    Path(order_ref): Path<String>,
    ValidatedJson(request): ValidatedJson<UpdateOrderStatusRequest>,
) -> AppResult<Json<ApiResponse<Order>>> {
    let order = state.orders.update_status(&order_ref, request, staff_id).await?;
    Ok(Json(ApiResponse::ok(order)))
}

async fn parse_order_form(mut multipart: Multipart) -> AppResult<(UploadedFile, SubmitOrderRequest)> {
    let mut file = None;
    let mut document_type = None;
    let mut service_level = None;
    let mut copies = None;
    let mut binding_type = None;
    let mut color_mode = None;
    let mut notes = None;
    let mut template_id = None;
    let mut page_count = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            let filename = field
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| AppError::Validation("file field has no filename".to_string()))?;
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
        let value = non_empty(value);

        match name.as_str() {
            "documentType" => document_type = value,
            "serviceLevel" => service_level = value,
            "copies" => copies = value,
            "bindingType" => binding_type = value,
            "colorMode" => color_mode = value,
            "notes" => notes = value,
            "templateId" => template_id = value,
            "pageCount" => page_count = value,
            other => {
                return Err(AppError::Validation(format!("Unknown field: {}", other)));
            }
        }
    }

    let file = file.ok_or_else(|| AppError::Validation("No file uploaded".to_string()))?;
    if document_type.is_none() || service_level.is_none() {
        return Err(AppError::Validation("Missing required fields".to_string()));
    }

    let request = SubmitOrderRequest {
        document_type: document_type.unwrap_or_default(),
        service_level: service_level.unwrap_or_default(),
        copies: copies
            .map(|c| c.parse::<i32>())
            .transpose()
            .map_err(|_| AppError::Validation("copies must be a whole number".to_string()))?
            .unwrap_or(1),
        binding_type,
        color_mode: parse_color_mode(color_mode.as_deref())?,
        notes,
        template_id,
        page_count: page_count
            .map(|p| p.parse::<u32>())
            .transpose()
            .map_err(|_| AppError::Validation("pageCount must be a whole number".to_string()))?,
    };

    Ok((file, request))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_color_mode(value: Option<&str>) -> AppResult<bool> {
    match value {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(AppError::Validation(format!(
            "colorMode must be true or false, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_mode_values() {
        assert!(!parse_color_mode(None).unwrap());
        assert!(parse_color_mode(Some("true")).unwrap());
        assert!(!parse_color_mode(Some("false")).unwrap());
        assert!(matches!(
            parse_color_mode(Some("sepia")),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_blank_fields_are_absent() {
        assert_eq!(non_empty("  ".to_string()), None);
        assert_eq!(non_empty(" A4 ".to_string()), Some("A4".to_string()));
    }
}
