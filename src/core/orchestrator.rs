//! 聊天编排器
//!
//! 每个请求：校验消息 → 解析/创建会话 → 配置检查 → 本地限流准入 → 调用后端 → 绑定上游续接 ID → 组装统一响应信封。
//! 除空消息外，任何失败（包括流水线内部 panic）都折叠为 success = false 的信封，不向调用方抛出。

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::core::{ChatError, RateLimiter, SessionId, SessionStore, ANONYMOUS_KEY};
use crate::llm::{Answer, BedrockClient, ChatBackend, RetryingUpstreamClient, StandInResponder};

/// 诊断接口使用的固定探测问题
pub const TEST_QUERY: &str = "Hello, can you help me?";

/// 统一响应信封
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResult {
    pub success: bool,
    pub answer: Option<String>,
    pub session_id: Option<String>,
    pub citations: Vec<Value>,
    pub error: Option<String>,
    pub timestamp: String,
    pub rate_limited: bool,
    pub retry_after: Option<u64>,
    /// 本地替身生成的回答
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stand_in: bool,
}

impl ChatResult {
    fn answered(answer: Answer, session_id: Option<String>, timestamp: String) -> Self {
        Self {
            success: true,
            answer: Some(answer.text),
            session_id,
            citations: answer.citations,
            error: None,
            timestamp,
            rate_limited: false,
            retry_after: None,
            stand_in: answer.stand_in,
        }
    }

    fn failed(err: &ChatError, session_id: Option<String>, timestamp: String) -> Self {
        Self {
            success: false,
            answer: None,
            session_id,
            citations: Vec::new(),
            error: Some(err.to_string()),
            timestamp,
            rate_limited: err.is_rate_limited(),
            retry_after: err.retry_after(),
            stand_in: false,
        }
    }
}

/// 根据配置选择后端：配置了凭证或端点时走 Bedrock + 重试，否则使用本地替身
pub fn create_backend_from_config(cfg: &AppConfig) -> Arc<dyn ChatBackend> {
    if !cfg.upstream.is_configured() {
        tracing::warn!("Bedrock credentials not configured, using mock responses");
        return Arc::new(StandInResponder);
    }

    let endpoint = cfg.upstream.endpoint();
    let client = BedrockClient::new(
        &endpoint,
        cfg.upstream.api_key(),
        cfg.upstream.request_timeout_secs,
    )
    .map(|client| match cfg.upstream.aws_credentials() {
        Some(credentials) => client.with_aws_credentials(credentials, &cfg.upstream.region),
        None => client,
    });

    match client {
        Ok(client) => {
            tracing::info!(
                "AWS Bedrock client initialized ({}, auth: {})",
                endpoint,
                client.auth_scheme()
            );
            Arc::new(RetryingUpstreamClient::new(
                Arc::new(client),
                cfg.upstream.target(),
                cfg.retry_config(),
            ))
        }
        Err(e) => {
            tracing::warn!("Failed to initialize Bedrock client: {}, using mock responses", e);
            Arc::new(StandInResponder)
        }
    }
}

pub struct ChatOrchestrator {
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    backend: Arc<dyn ChatBackend>,
}

impl ChatOrchestrator {
    pub fn new(
        sessions: Arc<SessionStore>,
        rate_limiter: Arc<RateLimiter>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            sessions,
            rate_limiter,
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    fn timestamp(&self) -> String {
        self.sessions.now().to_rfc3339()
    }

    /// 处理一条聊天消息。
    ///
    /// 只有空消息返回 Err（调用方应当作请求错误拒绝），其余结果都在信封中。
    pub async fn handle_chat(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<ChatResult, ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        // 流水线 panic 时仍把已解析出的会话 ID 交还给调用方
        let resolved: Mutex<Option<SessionId>> = Mutex::new(None);
        match AssertUnwindSafe(self.run_chat(message, session_id, &resolved))
            .catch_unwind()
            .await
        {
            Ok(result) => Ok(result),
            Err(_) => {
                let session_id = resolved.lock().ok().and_then(|id| id.clone());
                tracing::error!(
                    "Chat pipeline panicked (session: {})",
                    session_id.as_deref().unwrap_or("none")
                );
                Ok(ChatResult::failed(
                    &ChatError::Internal("unexpected failure while handling chat".to_string()),
                    session_id,
                    self.timestamp(),
                ))
            }
        }
    }

    async fn run_chat(
        &self,
        message: &str,
        requested: Option<&str>,
        resolved: &Mutex<Option<SessionId>>,
    ) -> ChatResult {
        let mut session_id = match self.open_session(requested).await {
            Ok(id) => id,
            Err(result) => return result,
        };
        if let Ok(mut slot) = resolved.lock() {
            *slot = Some(session_id.clone());
        }
        let snapshot = self.sessions.get(&session_id).await;

        match self.backend.invoke(message, snapshot.as_ref()).await {
            Ok(answer) => {
                if let Some(upstream_id) = answer.upstream_session_id.clone() {
                    let created_at = snapshot.as_ref().map(|s| s.created_at);
                    self.sessions.bind_upstream(&upstream_id, created_at).await;
                    session_id = upstream_id;
                }
                ChatResult::answered(answer, Some(session_id), self.timestamp())
            }
            Err(e) => {
                tracing::error!("Chat failed for session {}: {}", session_id, e);
                ChatResult::failed(&e, Some(session_id), self.timestamp())
            }
        }
    }

    /// 解析会话并完成准入。
    ///
    /// 已有会话先准入、通过后才计数；新会话先创建再准入（新窗口必然为空）。
    /// 准入期间会话被删除时撤销刚记下的窗口，按新会话重新准入。
    async fn open_session(&self, requested: Option<&str>) -> Result<SessionId, ChatResult> {
        if let Some(id) = requested {
            if self.sessions.contains(id).await {
                self.admit(id).await?;
                if self.sessions.touch(id).await {
                    return Ok(id.to_string());
                }
                tracing::warn!("Session {} was removed during admission, starting a new one", id);
                self.rate_limiter.forget_all([id]).await;
            }
        }

        let id = self.sessions.resolve_or_create(None).await;
        self.admit(&id).await?;
        Ok(id)
    }

    /// 配置检查 + 限流准入；配置错误不占用配额
    async fn admit(&self, session_id: &str) -> Result<(), ChatResult> {
        if let Err(e) = self.backend.preflight() {
            return Err(ChatResult::failed(
                &e,
                Some(session_id.to_string()),
                self.timestamp(),
            ));
        }

        let admission = self.rate_limiter.admit(session_id, Instant::now()).await;
        if !admission.allowed {
            tracing::warn!(
                "Rate limit exceeded for session {}, retry after {} seconds",
                session_id,
                admission.retry_after
            );
            let err = ChatError::RateLimited {
                retry_after: admission.retry_after,
            };
            return Err(ChatResult::failed(
                &err,
                Some(session_id.to_string()),
                self.timestamp(),
            ));
        }
        Ok(())
    }

    /// 以固定问题探测后端（anonymous 限流 key，不关联会话）
    pub async fn test_connection(&self) -> ChatResult {
        if let Err(e) = self.backend.preflight() {
            return ChatResult::failed(&e, None, self.timestamp());
        }

        let admission = self.rate_limiter.admit(ANONYMOUS_KEY, Instant::now()).await;
        if !admission.allowed {
            let err = ChatError::RateLimited {
                retry_after: admission.retry_after,
            };
            return ChatResult::failed(&err, None, self.timestamp());
        }

        match self.backend.invoke(TEST_QUERY, None).await {
            Ok(answer) => {
                let session_id = answer.upstream_session_id.clone();
                if let Some(id) = &session_id {
                    self.sessions.bind_upstream(id, None).await;
                }
                ChatResult::answered(answer, session_id, self.timestamp())
            }
            Err(e) => ChatResult::failed(&e, None, self.timestamp()),
        }
    }
}
