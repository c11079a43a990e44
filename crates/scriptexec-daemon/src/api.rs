//! Human-facing HTTP surface.
//!
//! Approvers act on pending records here; the same listener serves health
//! and metrics. The step-execution RPC surface is mounted by the transport
//! layer, not this router.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use scriptexec_core::approval::{ApprovalError, Checker};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::metrics::MetricsRegistry;
use crate::service::ExecutorService;

/// Header carrying the acting user's identity.
///
/// Populated by the ingress auth layer; absent callers act as `anonymous`
/// and fail the approver-membership check unless explicitly listed.
const USER_HEADER: &str = "x-user";

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    /// Approval coordinator; `None` when gating is disabled.
    pub checker: Option<Arc<Checker>>,
    /// Service facade, for health reporting.
    pub service: Arc<ExecutorService>,
    /// Metrics registry, for the scrape endpoint.
    pub registry: Arc<MetricsRegistry>,
}

/// Builds the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/v1/approvals/pending", get(list_pending))
        .route(
            "/api/v1/approvals/{execution_id}/{step_name}/approve",
            post(approve),
        )
        .route(
            "/api/v1/approvals/{execution_id}/{step_name}/deny",
            post(deny),
        )
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<crate::service::HealthStatus> {
    Json(state.service.health())
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.registry.encode_text() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn list_pending(State(state): State<AppState>) -> Response {
    let Some(checker) = &state.checker else {
        return approval_disabled();
    };
    match checker.list_pending().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => approval_error(&err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct DenyBody {
    #[serde(default)]
    reason: String,
}

async fn approve(
    State(state): State<AppState>,
    Path((execution_id, step_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(checker) = &state.checker else {
        return approval_disabled();
    };
    let user = acting_user(&headers);
    match checker.approve(&execution_id, &step_name, &user).await {
        Ok(request) => {
            info!(execution_id, step_name, approver = %user, "execution approved");
            state
                .registry
                .executor_metrics()
                .observe_approval("approved");
            Json(json!({"status": "approved", "approved_by": request.approved_by})).into_response()
        }
        Err(err) => approval_error(&err),
    }
}

async fn deny(
    State(state): State<AppState>,
    Path((execution_id, step_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(checker) = &state.checker else {
        return approval_disabled();
    };
    let user = acting_user(&headers);
    // The reason body is optional; anything unparsable reads as no reason.
    let reason = serde_json::from_slice::<DenyBody>(&body)
        .map(|body| body.reason)
        .unwrap_or_default();
    match checker.deny(&execution_id, &step_name, &user, &reason).await {
        Ok(request) => {
            info!(execution_id, step_name, denier = %user, "execution denied");
            state.registry.executor_metrics().observe_approval("denied");
            Json(json!({"status": "denied", "denied_by": request.denied_by})).into_response()
        }
        Err(err) => approval_error(&err),
    }
}

fn acting_user(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

fn approval_disabled() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "approval not enabled"})),
    )
        .into_response()
}

fn approval_error(err: &ApprovalError) -> Response {
    let status = match err {
        ApprovalError::NotFound { .. } => StatusCode::NOT_FOUND,
        ApprovalError::Unauthorized(_) => StatusCode::FORBIDDEN,
        ApprovalError::NotPending(_) => StatusCode::CONFLICT,
        ApprovalError::Encoding(_) | ApprovalError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use scriptexec_core::approval::{ConfigMapStore, Status};
    use scriptexec_core::cluster::FakeCluster;
    use scriptexec_core::config::ExecutorConfig;
    use scriptexec_core::execution::Manager;
    use tower::util::ServiceExt;

    use super::*;

    const NS: &str = "opscontrolroom-system";

    async fn state_with_pending() -> (AppState, Arc<Checker>) {
        let cluster = Arc::new(FakeCluster::new());
        let store = ConfigMapStore::new(cluster.clone(), NS, "script-approvals");
        let checker = Arc::new(Checker::new(Arc::new(store), vec![]));
        checker
            .create_request(
                "exec-1",
                "step-a",
                "rb-1",
                "alice",
                "echo hi",
                "hash",
                vec!["bob".into()],
            )
            .await
            .unwrap();

        let registry = Arc::new(MetricsRegistry::try_new().unwrap());
        let manager = Arc::new(Manager::new(ExecutorConfig::default(), cluster));
        let service = Arc::new(ExecutorService::new(manager, registry.executor_metrics()));
        (
            AppState {
                checker: Some(checker.clone()),
                service,
                registry,
            },
            checker,
        )
    }

    fn post_request(path: &str, user: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method("POST").uri(path);
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn approve_endpoint_flips_the_record() {
        let (state, checker) = state_with_pending().await;
        let response = router(state)
            .oneshot(post_request(
                "/api/v1/approvals/exec-1/step-a/approve",
                Some("bob"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            checker.check("exec-1", "step-a").await.unwrap(),
            Status::Approved
        );
    }

    #[tokio::test]
    async fn unauthorized_approver_is_forbidden() {
        let (state, checker) = state_with_pending().await;
        let response = router(state)
            .oneshot(post_request(
                "/api/v1/approvals/exec-1/step-a/approve",
                Some("mallory"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            checker.check("exec-1", "step-a").await.unwrap(),
            Status::Pending
        );
    }

    #[tokio::test]
    async fn deny_accepts_a_reason_body() {
        let (state, checker) = state_with_pending().await;
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/v1/approvals/exec-1/step-a/deny")
            .header("x-user", "bob")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"reason": "too risky"}"#))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            checker.check("exec-1", "step-a").await.unwrap(),
            Status::Denied
        );
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        let (state, _) = state_with_pending().await;
        let response = router(state)
            .oneshot(post_request(
                "/api/v1/approvals/ghost/step-a/approve",
                Some("bob"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pending_endpoint_lists_open_records() {
        let (state, checker) = state_with_pending().await;
        let response = router(state.clone())
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/approvals/pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let records: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["execution_id"], "exec-1");
        assert_eq!(records[0]["status"], "pending");

        // Once decided, the record drops out of the listing.
        checker.approve("exec-1", "step-a", "bob").await.unwrap();
        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/approvals/pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let records: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn healthz_serves() {
        let (state, _) = state_with_pending().await;
        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
