//! 各路由处理函数

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::core::{ChatError, ChatResult, TEST_QUERY};

const VERSION: &str = "2.1.0";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// POST /chat
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResult>, ApiError> {
    tracing::info!(
        "Chat request (session: {})",
        req.session_id.as_deref().unwrap_or("new")
    );
    match state
        .orchestrator
        .handle_chat(&req.message, req.session_id.as_deref())
        .await
    {
        Ok(result) => Ok(Json(result)),
        Err(e @ ChatError::EmptyMessage) => Err(ApiError::bad_request(e.to_string())),
        Err(e) => Err(ApiError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        )),
    }
}

/// GET /health：先清理过期会话
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.sessions.sweep_expired().await;
    let cfg = &state.config;

    Json(json!({
        "status": "healthy",
        "service": cfg.app.name,
        "utc_time": Utc::now().to_rfc3339(),
        "local_time": state.sessions.now().to_rfc3339(),
        "bedrock_available": !state.backend().is_stand_in(),
        "backend": state.backend().name(),
        "active_sessions": state.sessions.active_count().await,
        "knowledge_base_id": cfg.upstream.knowledge_base_id,
        "aws_region": cfg.upstream.region,
        "rate_limiting": {
            "max_requests": cfg.rate_limit.max_requests,
            "window_seconds": cfg.rate_limit.window_seconds,
            "max_retries": cfg.retry.max_retries,
            "retry_delay": cfg.retry.retry_delay_secs,
            "tracked_keys": state.rate_limiter.tracked_keys().await,
        },
        "environment": {
            "debug": cfg.app.debug,
            "log_level": cfg.app.log_level,
            "session_cleanup_hours": cfg.session.cleanup_hours,
            "aws_credentials_configured": cfg.upstream.aws_credentials().is_some(),
            "api_key_configured": cfg.upstream.api_key().is_some(),
        },
    }))
}

/// GET /sessions：先清理过期会话
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.sessions.sweep_expired().await;
    let sessions = state.sessions.list().await;
    Json(json!({
        "total_sessions": sessions.len(),
        "sessions": sessions,
    }))
}

/// DELETE /sessions/:id
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.sessions.delete(&id).await {
        return Err(ApiError::not_found("Session not found"));
    }
    tracing::info!("Deleted session {}", id);
    Ok(Json(json!({
        "success": true,
        "message": format!("Session {} deleted successfully", id),
    })))
}

/// DELETE /sessions
pub async fn clear_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cleared = state.sessions.clear().await;
    tracing::info!("Cleared {} sessions", cleared);
    Json(json!({
        "success": true,
        "message": format!("All {} sessions cleared successfully", cleared),
        "cleared": cleared,
    }))
}

/// GET /rate-limits/:id：只读，不占用配额
pub async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let status = state.rate_limiter.status(&id, Instant::now()).await;
    Json(json!({
        "session_id": id,
        "allowed": status.allowed,
        "retry_after": status.retry_after,
        "current_requests": status.current_requests,
        "max_requests": state.rate_limiter.max_requests(),
        "window_seconds": state.rate_limiter.window_seconds(),
    }))
}

/// POST /rate-limits/reset/:id
pub async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let message = if state.rate_limiter.reset(&id).await {
        tracing::info!("Rate limit reset for session {}", id);
        format!("Rate limit reset for session {}", id)
    } else {
        format!("No rate limit data found for session {}", id)
    };
    Json(json!({ "success": true, "message": message }))
}

/// GET /bedrock/status：上游配置（不含密钥）
pub async fn bedrock_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = &state.config;
    let initialized = !state.backend().is_stand_in();
    let connection_test = if initialized {
        "client_initialized"
    } else {
        "not_attempted"
    };
    Json(json!({
        "client_initialized": initialized,
        "backend": state.backend().name(),
        "knowledge_base_id": cfg.upstream.knowledge_base_id,
        "aws_region": cfg.upstream.region,
        "model_id": cfg.upstream.model_id,
        "endpoint": cfg.upstream.endpoint(),
        "aws_credentials_configured": cfg.upstream.aws_credentials().is_some(),
        "api_key_configured": cfg.upstream.api_key().is_some(),
        "rate_limiting": {
            "enabled": true,
            "max_requests": cfg.rate_limit.max_requests,
            "window_seconds": cfg.rate_limit.window_seconds,
            "max_retries": cfg.retry.max_retries,
            "retry_delay": cfg.retry.retry_delay_secs,
        },
        "connection_test": connection_test,
    }))
}

/// POST /bedrock/test：用固定问题探测后端
pub async fn bedrock_test(State(state): State<Arc<AppState>>) -> Json<Value> {
    let result = state.orchestrator.test_connection().await;
    Json(json!({
        "test_query": TEST_QUERY,
        "result": result,
        "bedrock_available": !state.backend().is_stand_in(),
        "timestamp": state.sessions.now().to_rfc3339(),
    }))
}

/// GET /config：非敏感配置
pub async fn show_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = &state.config;
    Json(json!({
        "app": cfg.app,
        "server": cfg.server,
        "upstream": {
            "knowledge_base_id": cfg.upstream.knowledge_base_id,
            "region": cfg.upstream.region,
            "model_id": cfg.upstream.model_id,
            "endpoint": cfg.upstream.endpoint(),
            "request_timeout_secs": cfg.upstream.request_timeout_secs,
            "aws_credentials_configured": cfg.upstream.aws_credentials().is_some(),
            "api_key_configured": cfg.upstream.api_key().is_some(),
        },
        "rate_limit": cfg.rate_limit,
        "retry": cfg.retry,
        "session": cfg.session,
    }))
}

/// GET /
pub async fn root(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "message": format!("{} is running", state.config.app.name),
        "version": VERSION,
        "health": "/health",
        "status": "/bedrock/status",
        "test": "/bedrock/test",
        "features": ["Rate limiting", "Retry logic", "Session management", "Error handling"],
    }))
}
