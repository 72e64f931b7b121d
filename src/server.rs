//! HTTP 入口（axum）
//!
//! - POST /api/chat：开始 / 继续一个回合
//! - POST /api/tool-result：外部执行端回传工具结果
//! - GET  /api/pending、/api/pending/stats、/api/pending/archive；POST /api/pending/:id/retry
//! - GET  /api/agents、/api/agents/:id/health、/api/health
//!
//! 错误统一返回 ErrorReport JSON，状态码按错误类别映射；thread 忙碌时返回 409。

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::agents::AgentProfile;
use crate::bridge::Bridge;
use crate::core::{BridgeError, ErrorContext, ErrorKind, ErrorReport};
use crate::orchestrator::{TurnOutcome, TurnRequest};

/// 对外错误：ErrorReport + 状态码
#[derive(Debug)]
pub struct ApiError(pub ErrorReport);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(self.0.kind)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Correlation | ErrorKind::RunActive => StatusCode::CONFLICT,
        ErrorKind::Configuration | ErrorKind::Processing => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Provider | ErrorKind::Delivery => StatusCode::BAD_GATEWAY,
    }
}

impl From<ErrorReport> for ApiError {
    fn from(report: ErrorReport) -> Self {
        Self(report)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.0)).into_response()
    }
}

fn rejection(e: JsonRejection) -> ApiError {
    ApiError(BridgeError::Validation(vec![e.body_text()]).report(ErrorContext::new()))
}

/// 回合结果：忙碌 409，其余 200
fn outcome_response(outcome: TurnOutcome) -> Response {
    let status = if outcome.is_busy() {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    (status, Json(outcome)).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentSummary {
    #[serde(flatten)]
    profile: AgentProfile,
    endpoint_ready: bool,
}

/// 创建路由
pub fn create_router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/tool-result", post(api_tool_result))
        .route("/api/pending", get(api_pending_list))
        .route("/api/pending/stats", get(api_pending_stats))
        .route("/api/pending/archive", get(api_pending_archive))
        .route("/api/pending/:id/retry", post(api_pending_retry))
        .route("/api/agents", get(api_agents_list))
        .route("/api/agents/:id/health", get(api_agent_health))
        .route("/api/health", get(api_health))
        .with_state(bridge)
}

/// POST /api/chat
async fn api_chat(
    State(bridge): State<Arc<Bridge>>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(raw) = payload.map_err(rejection)?;
    let request: TurnRequest = serde_json::from_value(raw).map_err(|e| {
        ApiError(BridgeError::Validation(vec![e.to_string()]).report(ErrorContext::new()))
    })?;
    let outcome = bridge.orchestrator.handle_turn(request).await?;
    Ok(outcome_response(outcome))
}

/// POST /api/tool-result
async fn api_tool_result(
    State(bridge): State<Arc<Bridge>>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(raw) = payload.map_err(rejection)?;
    let outcome = bridge.orchestrator.submit_tool_result(&raw).await?;
    Ok(outcome_response(outcome))
}

/// GET /api/pending：按创建时间排序
async fn api_pending_list(State(bridge): State<Arc<Bridge>>) -> Json<serde_json::Value> {
    let mut calls = bridge.store.list_all().await;
    calls.sort_by_key(|c| c.created_at);
    Json(json!({ "count": calls.len(), "calls": calls }))
}

async fn api_pending_stats(State(bridge): State<Arc<Bridge>>) -> Json<crate::store::PendingStats> {
    Json(bridge.store.stats(Utc::now()).await)
}

async fn api_pending_archive(State(bridge): State<Arc<Bridge>>) -> Json<serde_json::Value> {
    let archived = bridge.store.archived().await;
    Json(json!({ "count": archived.len(), "calls": archived }))
}

/// POST /api/pending/:id/retry：重投一条 failed 记录
async fn api_pending_retry(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let result = bridge
        .dispatch
        .redeliver(&id)
        .await
        .map_err(|e| ApiError(e.report(ErrorContext::new().with_call(&id))))?;
    Ok((StatusCode::OK, Json(result)).into_response())
}

async fn api_agents_list(State(bridge): State<Arc<Bridge>>) -> Json<serde_json::Value> {
    let agents: Vec<AgentSummary> = bridge
        .agents
        .list()
        .into_iter()
        .map(|profile| AgentSummary {
            endpoint_ready: profile.endpoint().is_some(),
            profile,
        })
        .collect();
    Json(json!({
        "defaultAgent": bridge.agents.default_agent().map(|a| a.id.clone()),
        "agents": agents,
    }))
}

/// GET /api/agents/:id/health：探测投递端点
async fn api_agent_health(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let report = bridge
        .dispatch
        .probe(&id)
        .await
        .map_err(|e| ApiError(e.report(ErrorContext::new().with_agent(&id))))?;
    Ok((StatusCode::OK, Json(report)).into_response())
}

async fn api_health(State(bridge): State<Arc<Bridge>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "pendingCalls": bridge.store.len().await,
        "agents": bridge.agents.list().len(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bridge::BridgeBuilder;
    use crate::config::{AgentSection, AppConfig};
    use crate::dispatch::{MockTransport, RecordingSleeper};
    use crate::provider::MockProvider;
    use crate::store::{CallStatus, PendingCall};

    fn bridge() -> Arc<Bridge> {
        let mut cfg = AppConfig::default();
        cfg.agents.insert(
            "sales".to_string(),
            AgentSection {
                name: None,
                assistant_id: "asst_sales".to_string(),
                webhook_url: Some("https://hooks.internal/sales".to_string()),
            },
        );
        Arc::new(
            BridgeBuilder::new(cfg)
                .with_provider(Arc::new(MockProvider::new()))
                .with_transport(Arc::new(MockTransport::new()))
                .with_sleeper(Arc::new(RecordingSleeper::new()))
                .build()
                .unwrap(),
        )
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Correlation), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Configuration), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::Delivery), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_chat_completes() {
        let app = create_router(bridge());
        let (status, body) = send(
            app,
            "POST",
            "/api/chat",
            Some(json!({"message": "ping", "agentId": "sales"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert!(body["threadId"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_chat_validation_error_shape() {
        let app = create_router(bridge());
        let (status, body) = send(app, "POST", "/api/chat", Some(json!({"message": "", "agentId": "sales"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["context"]["agentId"], "sales");
    }

    #[tokio::test]
    async fn test_tool_result_mismatch_is_conflict() {
        let bridge = bridge();
        bridge
            .store
            .put(PendingCall::new("call_1", "thread_1", "run_1", "sales", "lookup", json!({})))
            .await;
        let app = create_router(Arc::clone(&bridge));
        let (status, body) = send(
            app,
            "POST",
            "/api/tool-result",
            Some(json!({"id": "call_1", "output": "x", "threadId": "thread_1", "runId": "run_other"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "correlation");
        assert_eq!(body["context"]["callId"], "call_1");
        assert_eq!(bridge.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_pending_endpoints() {
        let bridge = bridge();
        let mut failed = PendingCall::new("call_f", "thread_1", "run_1", "sales", "lookup", json!({}));
        failed.status = CallStatus::Failed;
        bridge.store.put(failed).await;

        let (status, body) = send(create_router(Arc::clone(&bridge)), "GET", "/api/pending", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (_, stats) = send(create_router(Arc::clone(&bridge)), "GET", "/api/pending/stats", None).await;
        assert_eq!(stats["byAgent"]["sales"], 1);
        assert_eq!(stats["byAge"]["<1m"], 1);

        let (status, body) = send(create_router(Arc::clone(&bridge)), "POST", "/api/pending/call_f/retry", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");

        let (status, body) = send(create_router(Arc::clone(&bridge)), "POST", "/api/pending/nope/retry", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["context"]["callId"], "nope");
    }

    #[tokio::test]
    async fn test_agents_and_health() {
        let bridge = bridge();
        let (_, body) = send(create_router(Arc::clone(&bridge)), "GET", "/api/agents", None).await;
        assert_eq!(body["agents"][0]["id"], "sales");
        assert_eq!(body["agents"][0]["endpointReady"], true);

        let (status, body) = send(create_router(Arc::clone(&bridge)), "GET", "/api/agents/sales/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reachable"], true);

        let (status, _) = send(create_router(Arc::clone(&bridge)), "GET", "/api/agents/ghost/health", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, body) = send(create_router(bridge), "GET", "/api/health", None).await;
        assert_eq!(body["status"], "ok");
    }
}
