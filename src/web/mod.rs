//! HTTP 层：共享状态、路由与 CORS
//!
//! 所有存储在启动时构建一次并注入 `AppState`；测试中每个用例各自构建一份。

pub mod handlers;

use std::sync::Arc;

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::AppConfig;
use crate::core::{create_backend_from_config, ChatOrchestrator, RateLimiter, SessionStore};
use crate::llm::ChatBackend;

/// 路由共享状态
pub struct AppState {
    pub config: AppConfig,
    pub sessions: Arc<SessionStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub orchestrator: ChatOrchestrator,
}

impl AppState {
    /// 按配置选择后端（Bedrock 或本地替身）
    pub fn from_config(config: AppConfig) -> Self {
        let backend = create_backend_from_config(&config);
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: AppConfig, backend: Arc<dyn ChatBackend>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_requests,
            config.rate_limit.window_seconds,
        ));
        let sessions = Arc::new(SessionStore::new(
            rate_limiter.clone(),
            config.utc_offset(),
            config.retention(),
        ));
        let orchestrator = ChatOrchestrator::new(sessions.clone(), rate_limiter.clone(), backend);
        Self {
            config,
            sessions,
            rate_limiter,
            orchestrator,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        self.orchestrator.backend()
    }
}

/// 以 `{"detail": "..."}` 返回的错误响应
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(list))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .route(
            "/sessions",
            get(handlers::list_sessions).delete(handlers::clear_sessions),
        )
        .route("/sessions/:id", delete(handlers::delete_session))
        .route("/rate-limits/:id", get(handlers::rate_limit_status))
        .route("/rate-limits/reset/:id", post(handlers::reset_rate_limit))
        .route("/bedrock/status", get(handlers::bedrock_status))
        .route("/bedrock/test", post(handlers::bedrock_test))
        .route("/config", get(handlers::show_config))
        .with_state(state)
        .layer(cors)
}
