//! 带分类重试的上游客户端
//!
//! 限流错误按 base_delay * 2^attempt 指数退避，其它可重试错误按 base_delay * (attempt + 1) 线性退避；
//! 参数非法 / 资源不存在 / 权限不足立即返回。等待期间让出执行权（tokio::time::sleep）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{ChatError, ErrorClass, Session};
use crate::llm::{Answer, ChatBackend, KnowledgeBase, RetrieveRequest};

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    pub max_retries: u32,
    pub base_delay: Duration,
    /// 上游限流重试耗尽后建议客户端等待的秒数
    pub throttle_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            throttle_cooldown_secs: 120,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次（从 0 开始）失败后的等待时长
    pub fn backoff(&self, class: ErrorClass, attempt: u32) -> Duration {
        match class {
            ErrorClass::Throttled => self.base_delay * 2u32.saturating_pow(attempt),
            _ => self.base_delay * (attempt + 1),
        }
    }
}

/// 调用上游所需的标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub knowledge_base_id: String,
    pub region: String,
    pub model_id: String,
}

impl UpstreamTarget {
    pub fn model_arn(&self) -> String {
        format!(
            "arn:aws:bedrock:{}::foundation-model/{}",
            self.region, self.model_id
        )
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.knowledge_base_id.trim().is_empty() {
            missing.push("knowledge_base_id");
        }
        if self.region.trim().is_empty() {
            missing.push("region");
        }
        if self.model_id.trim().is_empty() {
            missing.push("model_id");
        }
        missing
    }
}

/// 包装 KnowledgeBase 的重试客户端
pub struct RetryingUpstreamClient {
    kb: Arc<dyn KnowledgeBase>,
    target: UpstreamTarget,
    retry: RetryConfig,
}

impl RetryingUpstreamClient {
    pub fn new(kb: Arc<dyn KnowledgeBase>, target: UpstreamTarget, retry: RetryConfig) -> Self {
        Self { kb, target, retry }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn build_request(&self, query: &str, session: Option<&Session>) -> RetrieveRequest {
        // 只续接上游签发过的会话，本地生成的 ID 一律不转发
        let session_id = match session {
            Some(s) if s.has_upstream_binding => {
                tracing::info!("Using existing Bedrock session ID: {}", s.id);
                Some(s.id.clone())
            }
            _ => {
                tracing::info!("Starting new Bedrock session (no session ID provided or invalid)");
                None
            }
        };
        RetrieveRequest {
            query: query.to_string(),
            knowledge_base_id: self.target.knowledge_base_id.clone(),
            model_arn: self.target.model_arn(),
            session_id,
        }
    }
}

#[async_trait]
impl ChatBackend for RetryingUpstreamClient {
    async fn invoke(&self, query: &str, session: Option<&Session>) -> Result<Answer, ChatError> {
        self.preflight()?;

        let request = self.build_request(query, session);
        let max = self.retry.max_retries;

        for attempt in 0..max {
            tracing::info!("Querying Bedrock (attempt {}/{})", attempt + 1, max);

            let err = match self.kb.retrieve_and_generate(&request).await {
                Ok(response) => {
                    tracing::info!("Successfully received response from Bedrock");
                    return Ok(Answer::from(response));
                }
                Err(e) => e,
            };
            tracing::error!("Bedrock error (attempt {}): {}", attempt + 1, err);

            let class = err.classify();
            let last = attempt + 1 >= max;
            match class {
                ErrorClass::InvalidRequest => return Err(ChatError::InvalidRequest(err.message)),
                ErrorClass::NotFound => return Err(ChatError::NotFound(err.message)),
                ErrorClass::AccessDenied => return Err(ChatError::AccessDenied(err.message)),
                ErrorClass::Throttled if last => {
                    return Err(ChatError::Throttled {
                        retry_after: self.retry.throttle_cooldown_secs,
                    })
                }
                ErrorClass::Other if last => {
                    return Err(ChatError::Upstream(format!(
                        "AWS error after {} attempts: {}",
                        max, err.message
                    )))
                }
                ErrorClass::Throttled | ErrorClass::Other => {
                    let wait = self.retry.backoff(class, attempt);
                    tracing::info!("{:?} upstream error, retrying in {:?}...", class, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }

        Err(ChatError::Upstream("Maximum retry attempts exceeded".to_string()))
    }

    fn preflight(&self) -> Result<(), ChatError> {
        let missing = self.target.missing_fields();
        if missing.is_empty() {
            return Ok(());
        }
        tracing::error!("Missing required upstream configuration: {}", missing.join(", "));
        Err(ChatError::Configuration(missing.join(", ")))
    }

    fn name(&self) -> &'static str {
        "bedrock"
    }
}
