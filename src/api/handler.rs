use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use validator::Validate;

use super::models::*;
use crate::{
    config::Config,
    error::{AppError, AppResult},
    ledger::{AuditReport, LedgerStore, TokenLedger},
    middleware::{CallerId, StaffId},
    orders::OrderService,
    payments::PaymentService,
    queue::JobQueue,
};

const DEFAULT_RECENT_TRANSACTIONS: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn LedgerStore>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: Arc<TokenLedger>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match state.store.ping().await {
        Ok(()) => ComponentStatus { healthy: true, error: None },
        Err(e) => {
            warn!(error = %e, "Health check: database unreachable");
            ComponentStatus {
                healthy: false,
                error: Some("database unreachable".to_string()),
            }
        }
    };

    let (queue, queue_depth) = match state.queue.depth().await {
        Ok(depth) => (ComponentStatus { healthy: true, error: None }, Some(depth)),
        Err(e) => {
            warn!(error = %e, "Health check: queue unreachable");
            (
                ComponentStatus {
                    healthy: false,
                    error: Some("queue unreachable".to_string()),
                },
                None,
            )
        }
    };

    // The queue is not needed to accept orders, so only the database decides the status code.
    let status_code = if database.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = if database.healthy && queue.healthy {
        "healthy"
    } else {
        "degraded"
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now(),
            database,
            queue,
            queue_depth,
        }),
    )
}

/// GET /api/balance
pub async fn get_balance(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Query(query): Query<BalanceQuery>,
) -> AppResult<Json<ApiResponse<BalanceResponse>>> {
    query.validate()?;

    let user = state
        .store
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

    let recent = query.recent.unwrap_or(DEFAULT_RECENT_TRANSACTIONS) as i64;
    let recent_transactions = state
        .store
        .list_recent_transactions(user_id, recent)
        .await?;

    Ok(Json(ApiResponse::ok(BalanceResponse {
        user_id: user.id,
        token_balance: user.token_balance,
        total_tokens_spent: user.total_tokens_spent,
        total_tokens_purchased: user.total_tokens_purchased,
        recent_transactions,
    })))
}

/// GET /api/admin/users/:id/audit (staff)
pub async fn audit_user(
    State(state): State<AppState>,
    StaffId(_staff_id): StaffId,
    Path(user_id): Path<i64>,
) -> AppResult<Json<ApiResponse<AuditReport>>> {
    let report = state.ledger.audit(user_id).await?;
    Ok(Json(ApiResponse::ok(report)))
}
