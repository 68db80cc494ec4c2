//! Admin API for account management
//!
//! Runs on a separate listener port (default 9090), never alongside work
//! traffic. When an ADMIN_TOKEN is configured, every endpoint requires it as
//! a bearer token.
//!
//! Endpoints:
//! - GET  /admin/accounts               — list accounts with circuit/usage state
//! - POST /admin/accounts               — register an account
//! - POST /admin/accounts/{id}/disable  — remove from rotation
//! - POST /admin/accounts/{id}/enable   — return to rotation
//! - GET  /admin/pool                   — pool health summary
//!
//! Listings never expose credentials.

use std::sync::Arc;

use account_pool::{AccountPool, Error as PoolError};
use account_store::Tier;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::warn;

use common::Secret;

use crate::metrics::record_api_request;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<AccountPool>,
    admin_token: Option<Arc<Secret<String>>>,
}

impl AdminState {
    pub fn new(pool: Arc<AccountPool>, admin_token: Option<Secret<String>>) -> Self {
        Self {
            pool,
            admin_token: admin_token.map(Arc::new),
        }
    }
}

/// Build the admin axum router with all account management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts).post(register_account))
        .route("/admin/accounts/{id}/disable", post(disable_account))
        .route("/admin/accounts/{id}/enable", post(enable_account))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    json_response(
        status,
        serde_json::json!({
            "error": { "type": error_type, "message": message }
        }),
    )
}

/// Check the bearer token when one is configured.
fn authorize(state: &AdminState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(token) = &state.admin_token else {
        return Ok(());
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(token.expose().as_str()) {
        Ok(())
    } else {
        warn!("admin request rejected: missing or invalid bearer token");
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid admin token",
        ))
    }
}

/// GET /admin/accounts — list all accounts with their live state.
async fn list_accounts(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let health = state.pool.health().await;
    let accounts = health
        .get("accounts")
        .cloned()
        .unwrap_or(serde_json::json!([]));

    record_api_request("admin_list_accounts", 200);
    json_response(StatusCode::OK, serde_json::json!({ "accounts": accounts }))
}

/// Request body for account registration.
#[derive(Deserialize)]
struct RegisterRequest {
    organization_id: String,
    name: String,
    credential: String,
    tier: String,
}

/// POST /admin/accounts — register an account.
///
/// Unknown tiers and malformed input are 400s; registering an already-known
/// credential is idempotent and returns the existing account.
async fn register_account(
    State(state): State<AdminState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<RegisterRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let tier = match Tier::parse(&body.tier) {
        Ok(tier) => tier,
        Err(e) => {
            record_api_request("admin_register", 400);
            return error_response(StatusCode::BAD_REQUEST, "validation_error", &e.to_string());
        }
    };

    match state
        .pool
        .register_account(&body.organization_id, &body.name, &body.credential, tier)
        .await
    {
        Ok(account) => {
            record_api_request("admin_register", 200);
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "account": {
                        "id": account.id,
                        "organization_id": account.organization_id,
                        "name": account.name,
                        "tier": account.tier.as_str(),
                        "status": account.status.label(),
                    }
                }),
            )
        }
        Err(PoolError::Validation(message)) => {
            record_api_request("admin_register", 400);
            error_response(StatusCode::BAD_REQUEST, "validation_error", &message)
        }
        Err(e) => {
            record_api_request("admin_register", 500);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "registry_error",
                &e.to_string(),
            )
        }
    }
}

/// POST /admin/accounts/{id}/disable — administrative removal from rotation.
async fn disable_account(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    set_status(&state, &id, false).await
}

/// POST /admin/accounts/{id}/enable — return to rotation.
async fn enable_account(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    set_status(&state, &id, true).await
}

async fn set_status(state: &AdminState, id: &str, enable: bool) -> Response {
    let result = if enable {
        state.pool.enable_account(id).await
    } else {
        state.pool.disable_account(id).await
    };
    let endpoint = if enable {
        "admin_enable"
    } else {
        "admin_disable"
    };

    match result {
        Ok(account) => {
            record_api_request(endpoint, 200);
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "account": { "id": account.id, "status": account.status.label() }
                }),
            )
        }
        Err(PoolError::Registry(account_store::Error::NotFound(_))) => {
            record_api_request(endpoint, 404);
            error_response(StatusCode::NOT_FOUND, "not_found", id)
        }
        Err(e) => {
            record_api_request(endpoint, 500);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "registry_error",
                &e.to_string(),
            )
        }
    }
}

/// GET /admin/pool — pool health summary.
async fn pool_status(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let health = state.pool.health().await;
    record_api_request("admin_pool", 200);
    json_response(StatusCode::OK, health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::breaker::{BreakerConfig, CircuitBreaker, MemoryCircuitStore};
    use account_pool::capacity::MemoryCapacityStore;
    use account_store::AccountStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_pool(dir: &std::path::Path) -> Arc<AccountPool> {
        let registry = Arc::new(
            AccountStore::load(dir.join("accounts.json")).await.unwrap(),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryCircuitStore::new()),
            BreakerConfig::default(),
        ));
        Arc::new(AccountPool::new(
            registry,
            Arc::new(MemoryCapacityStore::new(Duration::from_secs(60))),
            breaker,
            Duration::from_secs(60),
        ))
    }

    fn register_body(name: &str, credential: &str, tier: &str) -> Body {
        Body::from(
            serde_json::json!({
                "organization_id": "org-1",
                "name": name,
                "credential": credential,
                "tier": tier,
            })
            .to_string(),
        )
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn list_accounts_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let app = build_admin_router(AdminState::new(pool, None));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/accounts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn register_then_list_never_exposes_credential() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let app = build_admin_router(AdminState::new(pool, None));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts")
                    .header("content-type", "application/json")
                    .body(register_body("primary", "sk-1", "tier2"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["account"]["tier"], "tier2");
        assert_eq!(json["account"]["status"], "active");
        assert!(json["account"].get("credential").is_none());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/accounts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = response_json(response).await;
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0]["name"], "primary");
        assert!(accounts[0].get("credential").is_none());
    }

    #[tokio::test]
    async fn register_rejects_unknown_tier() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let app = build_admin_router(AdminState::new(pool, None));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts")
                    .header("content-type", "application/json")
                    .body(register_body("primary", "sk-1", "platinum"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert_eq!(json["error"]["type"], "validation_error");
    }

    #[tokio::test]
    async fn register_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let app = build_admin_router(AdminState::new(pool, None));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts")
                    .header("content-type", "application/json")
                    .body(register_body("", "sk-1", "tier1"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn disable_and_enable_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let account = pool
            .register_account("org-1", "primary", "sk-1", Tier::Tier1)
            .await
            .unwrap();
        let app = build_admin_router(AdminState::new(pool, None));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/admin/accounts/{}/disable", account.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["account"]["status"], "disabled");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/admin/accounts/{}/enable", account.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["account"]["status"], "active");
    }

    #[tokio::test]
    async fn disable_unknown_account_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let app = build_admin_router(AdminState::new(pool, None));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/ghost/disable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pool_status_reports_health() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        pool.register_account("org-1", "primary", "sk-1", Tier::Tier1)
            .await
            .unwrap();
        let app = build_admin_router(AdminState::new(pool, None));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/pool")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["accounts_total"], 1);
    }

    #[tokio::test]
    async fn admin_token_gates_every_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let app = build_admin_router(AdminState::new(
            pool,
            Some(Secret::new("topsecret".to_string())),
        ));

        // No token
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/admin/accounts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Wrong token
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/admin/pool")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct token
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/pool")
                    .header("authorization", "Bearer topsecret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
