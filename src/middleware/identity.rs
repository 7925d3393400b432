use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

/// Header set by the auth gateway for authenticated customers.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header set by the auth gateway for staff sessions.
pub const STAFF_ID_HEADER: &str = "x-staff-id";

/// Authenticated customer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub i64);

/// Authenticated staff member id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaffId(pub i64);

fn header_id(parts: &Parts, name: &str) -> Result<i64, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or(AppError::Unauthorized)
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_id(parts, USER_ID_HEADER).map(CallerId)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for StaffId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_id(parts, STAFF_ID_HEADER).map(StaffId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract_caller(value: Option<&str>) -> Result<CallerId, AppError> {
        let mut builder = Request::builder().uri("/api/balance");
        if let Some(value) = value {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CallerId::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_caller_header_parsing() {
        assert_eq!(extract_caller(Some("42")).await.unwrap(), CallerId(42));
        assert!(matches!(extract_caller(None).await, Err(AppError::Unauthorized)));
        assert!(matches!(extract_caller(Some("abc")).await, Err(AppError::Unauthorized)));
        assert!(matches!(extract_caller(Some("-3")).await, Err(AppError::Unauthorized)));
    }
}
