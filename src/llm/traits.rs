//! 上游生成能力抽象
//!
//! 两层 trait：
//! - KnowledgeBase：单次远程调用（检索 + 生成），返回原始结果或带错误码的 UpstreamError
//! - ChatBackend：编排器看到的统一接口；RetryingUpstreamClient（真实上游 + 重试）与 StandInResponder（本地替身）两种实现，启动时二选一

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{ChatError, Session, UpstreamError};

/// 一次检索生成请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub query: String,
    pub knowledge_base_id: String,
    pub model_arn: String,
    /// 续接 ID：只有上游签发过的 ID 才会放进来
    pub session_id: Option<String>,
}

/// 上游成功响应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrieveResponse {
    pub text: String,
    pub citations: Vec<Value>,
    pub session_id: Option<String>,
}

/// 远程知识库调用（Bedrock RetrieveAndGenerate 或测试替身）
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn retrieve_and_generate(
        &self,
        request: &RetrieveRequest,
    ) -> Result<RetrieveResponse, UpstreamError>;
}

/// 后端给出的答复
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Value>,
    /// 上游签发的续接 ID
    pub upstream_session_id: Option<String>,
    /// 是否为本地替身生成
    pub stand_in: bool,
}

impl From<RetrieveResponse> for Answer {
    fn from(r: RetrieveResponse) -> Self {
        Self {
            text: r.text,
            citations: r.citations,
            upstream_session_id: r.session_id.filter(|id| !id.is_empty()),
            stand_in: false,
        }
    }
}

/// 聊天后端：编排器只依赖这个接口
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// 以 query 调用后端；session 为当前会话快照（用于决定是否续接上游会话）
    async fn invoke(&self, query: &str, session: Option<&Session>) -> Result<Answer, ChatError>;

    /// 调用前的配置检查；失败时不应占用重试次数或限流配额
    fn preflight(&self) -> Result<(), ChatError> {
        Ok(())
    }

    /// 是否为本地替身（未配置上游）
    fn is_stand_in(&self) -> bool {
        false
    }

    /// 用于日志与诊断接口的后端名
    fn name(&self) -> &'static str;
}
