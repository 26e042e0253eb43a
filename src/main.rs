//! kbchat - 知识库问答网关
//!
//! 入口：加载配置、初始化日志、选择上游后端并启动 HTTP 服务。
//! 用法：kbchat [config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use kbchat::config::{load_config, AppConfig};
use kbchat::observability;
use kbchat::web::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let (cfg, load_error) = match load_config(config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    observability::init(&cfg.app.log_level);
    if let Some(e) = load_error {
        tracing::warn!("Failed to load config, using defaults: {}", e);
    }

    tracing::info!("Starting {}", cfg.app.name);
    tracing::info!("Knowledge Base ID: {}", cfg.upstream.knowledge_base_id);
    tracing::info!("AWS Region: {}", cfg.upstream.region);
    tracing::info!("Model ID: {}", cfg.upstream.model_id);
    tracing::info!(
        "Rate limit: {} requests per {} seconds",
        cfg.rate_limit.max_requests,
        cfg.rate_limit.window_seconds
    );
    tracing::info!(
        "Retry: {} attempts, base delay {}s",
        cfg.retry.max_retries,
        cfg.retry.retry_delay_secs
    );

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let state = Arc::new(AppState::from_config(cfg));
    tracing::info!("Backend: {}", state.backend().name());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
