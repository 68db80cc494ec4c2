//! Work-traffic API
//!
//! The narrow contract business-logic callers consume:
//!
//! - POST /v1/select  — pick an account for a unit of work, reserving capacity
//! - POST /v1/outcome — report how the upstream call went, exactly once
//!
//! Exhaustion maps to HTTP status by retryability: 503 when waiting can help
//! (capacity, open circuits, store outage), 409 when the organization has no
//! active accounts at all and waiting cannot. The exhaustion report rides in
//! the body either way so callers can implement their own backoff.

use std::sync::Arc;

use account_pool::{AccountPool, Outcome, SelectionOutcome};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::Deserialize;

use crate::metrics::record_api_request;

/// Shared state for work-traffic handlers.
#[derive(Clone)]
pub struct ApiState {
    pub pool: Arc<AccountPool>,
}

/// Build the work-traffic axum router.
pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/select", post(select))
        .route("/v1/outcome", post(outcome))
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

/// Request body for /v1/select.
#[derive(Deserialize)]
struct SelectRequest {
    organization_id: String,
    /// Estimated cost in token units (caller-defined semantics)
    estimated_cost: u64,
}

/// POST /v1/select — select an account and reserve capacity on it.
///
/// The response carries the account's credential (the caller performs the
/// upstream call itself) and the reservation ticket to quote back in
/// /v1/outcome.
async fn select(State(state): State<ApiState>, axum::Json(body): axum::Json<SelectRequest>) -> Response {
    match state.pool.select(&body.organization_id, body.estimated_cost).await {
        SelectionOutcome::Selected(selected) => {
            record_api_request("select", 200);
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "account": {
                        "id": selected.account_id,
                        "organization_id": selected.organization_id,
                        "name": selected.name,
                        "tier": selected.tier.as_str(),
                        "credential": selected.credential,
                    },
                    "reservation_id": selected.reservation_id,
                    "estimated_cost": selected.estimated_cost,
                }),
            )
        }
        SelectionOutcome::Exhausted(report) => {
            let status = if report.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::CONFLICT
            };
            record_api_request("select", status.as_u16());
            json_response(
                status,
                serde_json::json!({
                    "error": {
                        "type": "pool_exhausted",
                        "retryable": report.is_retryable(),
                        "report": report,
                    }
                }),
            )
        }
    }
}

/// Request body for /v1/outcome.
#[derive(Deserialize)]
struct OutcomeRequest {
    account_id: String,
    reservation_id: String,
    success: bool,
    #[serde(default)]
    actual_cost: Option<u64>,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// POST /v1/outcome — reconcile a reservation with the real result.
///
/// Always 202: bookkeeping failures are retried and logged inside the pool,
/// never surfaced, since the caller's request already completed.
async fn outcome(
    State(state): State<ApiState>,
    axum::Json(body): axum::Json<OutcomeRequest>,
) -> Response {
    state
        .pool
        .record_outcome(
            &body.account_id,
            Outcome {
                reservation_id: body.reservation_id,
                success: body.success,
                actual_cost: body.actual_cost,
                failure_reason: body.failure_reason,
            },
        )
        .await;

    record_api_request("outcome", 202);
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({ "status": "accepted" }),
    )
}
