use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Router,
};
use std::future::Future;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{audit_user, get_balance, health_check, AppState},
    middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer},
    orders::handlers::{get_order, list_my_orders, list_orders, submit_order, update_order_status},
    payments::handlers::{
        create_payment_order, list_my_payments, list_packages, list_payment_methods,
        list_pending_payments, upload_proof, verify_payment,
    },
};

/// Room for multipart framing on top of the largest accepted file.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let server = &state.config.server;
    let body_limit = state.config.storage.max_upload_bytes + MULTIPART_OVERHEAD;
    let rate_limit = RateLimitLayer::per_minute(server.rate_limit_per_minute);

    let api = Router::new()
        // Orders
        .route("/orders", post(submit_order).get(list_orders))
        .route("/orders/:order_ref", get(get_order))
        .route("/orders/:order_ref/status", patch(update_order_status))
        .route("/my-orders", get(list_my_orders))
        // Token purchases
        .route("/packages", get(list_packages))
        .route("/payment-methods", get(list_payment_methods))
        .route("/payment-orders", post(create_payment_order))
        .route("/payment-orders/:id/proof", post(upload_proof))
        .route("/my-payments", get(list_my_payments))
        .route("/balance", get(get_balance))
        // Staff
        .route("/admin/pending-payments", get(list_pending_payments))
        .route("/admin/payments/:id/verify", post(verify_payment))
        .route("/admin/users/:id/audit", get(audit_user))
        .layer(from_fn_with_state(rate_limit, rate_limit_middleware));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout_secs)))
                .layer(CompressionLayer::new())
                .layer(create_cors_layer(&server.cors_origins)),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::build_application;
    use crate::config::Config;
    use crate::ledger::{InMemoryLedgerStore, LedgerStore};
    use crate::queue::InMemoryJobQueue;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "printshop-test-boundary";

    struct TestApp {
        router: Router,
        store: Arc<InMemoryLedgerStore>,
        queue: Arc<InMemoryJobQueue>,
        _dir: TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load().unwrap();
        config.storage.root = dir.path().to_path_buf();
        config.queue.output_dir = dir.path().join("outputs");
        config.server.rate_limit_per_minute = 1000;

        let store = Arc::new(
            InMemoryLedgerStore::new(Duration::from_millis(500)).with_default_catalog(),
        );
        let queue = Arc::new(InMemoryJobQueue::new());
        let app = build_application(Arc::new(config), store.clone(), queue.clone()).unwrap();

        TestApp {
            router: create_app(app.state),
            store,
            queue,
            _dir: dir,
        }
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some((name, filename, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    BOUNDARY, name, filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn order_form(extra: &[(&str, &str)]) -> Vec<u8> {
        let mut fields = vec![
            ("documentType", "skripsi"),
            ("serviceLevel", "standard"),
            ("copies", "1"),
            ("colorMode", "false"),
        ];
        fields.extend_from_slice(extra);
        multipart_body(&fields, Some(("file", "bab1.docx", b"PK\x03\x04 docx")))
    }

    fn multipart_request(uri: &str, user_id: Option<i64>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri).header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
        if let Some(user_id) = user_id {
            builder = builder.header("x-user-id", user_id.to_string());
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn json_request(method: &str, uri: &str, header: (&str, i64), body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header.0, header.1.to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let response = app
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue_depth"], 0);
    }

    #[tokio::test]
    async fn test_submit_order_returns_created() {
        let app = test_app();
        let user = app.store.seed_user(5);

        let response = app
            .router
            .oneshot(multipart_request("/api/orders", Some(user.id), order_form(&[])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "processing");
        assert_eq!(body["tokens_remaining"], 4);
        assert!(body["orderId"].as_str().unwrap().starts_with("ORD-"));
        assert!(body["dbId"].as_i64().is_some());
        assert_eq!(body["warnings"], serde_json::json!([]));

        let job = app.queue.pop().unwrap();
        assert_eq!(job.order_ref, body["orderId"].as_str().unwrap());
        assert!(job.output.ends_with("_formatted.docx"));
    }

    #[tokio::test]
    async fn test_submit_order_without_tokens_is_payment_required() {
        let app = test_app();
        let user = app.store.seed_user(0);

        let response = app
            .router
            .oneshot(multipart_request("/api/orders", Some(user.id), order_form(&[])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error_code"], "INSUFFICIENT_BALANCE");
        assert_eq!(app.store.order_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_order_rejects_bad_forms() {
        let app = test_app();
        let user = app.store.seed_user(5);

        let unauthenticated = app
            .router
            .clone()
            .oneshot(multipart_request("/api/orders", None, order_form(&[])))
            .await
            .unwrap();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

        let no_file = multipart_body(&[("documentType", "skripsi"), ("serviceLevel", "fast")], None);
        let response = app
            .router
            .clone()
            .oneshot(multipart_request("/api/orders", Some(user.id), no_file))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .router
            .clone()
            .oneshot(multipart_request(
                "/api/orders",
                Some(user.id),
                order_form(&[("discountCode", "FREE")]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error_code"], "VALIDATION_ERROR");

        assert_eq!(app.store.get_user(user.id).await.unwrap().unwrap().token_balance, 5);
    }

    #[tokio::test]
    async fn test_purchase_flow_over_http() {
        let app = test_app();
        let user = app.store.seed_user(0);

        let response = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/payment-orders",
                ("x-user-id", user.id),
                serde_json::json!({ "package_id": 2, "payment_method": "qris" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let order_id = json_body(response).await["data"]["id"].as_i64().unwrap();

        let proof = multipart_body(
            &[("transfer_amount", "40000"), ("transfer_date", "2026-01-27")],
            Some(("proof", "bukti.png", b"\x89PNG proof")),
        );
        let response = app
            .router
            .clone()
            .oneshot(multipart_request(
                &format!("/api/payment-orders/{}/proof", order_id),
                Some(user.id),
                proof,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["status"], "paid");

        let verify = |action: &str| {
            json_request(
                "POST",
                &format!("/api/admin/payments/{}/verify", order_id),
                ("x-staff-id", 900),
                serde_json::json!({ "action": action, "notes": "ok" }),
            )
        };

        let response = app.router.clone().oneshot(verify("approve")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["tokens_credited"], 55);

        let response = app.router.clone().oneshot(verify("approve")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.router.clone().oneshot(verify("refund")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .router
            .clone()
            .oneshot(
                Request::get("/api/balance")
                    .header("x-user-id", user.id.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"]["token_balance"], 55);
        assert_eq!(body["data"]["recent_transactions"][0]["amount"], 55);

        let response = app
            .router
            .oneshot(
                Request::get(format!("/api/admin/users/{}/audit", user.id))
                    .header("x-staff-id", "900")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await["data"]["consistent"], true);
    }

    #[tokio::test]
    async fn test_verify_unknown_payment_is_not_found() {
        let app = test_app();

        let response = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/admin/payments/777/verify",
                ("x-staff-id", 900),
                serde_json::json!({ "action": "approve" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Customers cannot reach staff routes.
        let response = app
            .router
            .oneshot(json_request(
                "POST",
                "/api/admin/payments/777/verify",
                ("x-user-id", 1),
                serde_json::json!({ "action": "approve" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_order_visibility() {
        let app = test_app();
        let owner = app.store.seed_user(5);
        let other = app.store.seed_user(5);

        let response = app
            .router
            .clone()
            .oneshot(multipart_request("/api/orders", Some(owner.id), order_form(&[])))
            .await
            .unwrap();
        let order_ref = json_body(response).await["orderId"].as_str().unwrap().to_string();

        let get_as = |header: (&str, String)| {
            Request::get(format!("/api/orders/{}", order_ref))
                .header(header.0, header.1)
                .body(Body::empty())
                .unwrap()
        };

        let response = app
            .router
            .clone()
            .oneshot(get_as(("x-user-id", owner.id.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .router
            .clone()
            .oneshot(get_as(("x-user-id", other.id.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .router
            .clone()
            .oneshot(
                Request::patch(format!("/api/orders/{}/status", order_ref))
                    .header("x-staff-id", "900")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"status":"READY","notes":"rak 3"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["status"], "ready");

        let response = app
            .router
            .oneshot(get_as(("x-staff-id", "900".to_string())))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["data"]["staff_notes"], "rak 3");
    }

    #[tokio::test]
    async fn test_out_of_range_page_is_bad_request() {
        let app = test_app();
        let user = app.store.seed_user(5);

        let response = app
            .router
            .oneshot(
                Request::get("/api/my-orders?page=9223372036854775807")
                    .header("x-user-id", user.id.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error_code"], "VALIDATION_ERROR");
    }
}
