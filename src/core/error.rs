//! 网关错误类型与上游错误分类
//!
//! ChatError 是对外的服务错误（最终折叠进响应信封）；UpstreamError 是单次上游调用的原始错误，
//! 由 RetryingUpstreamClient 根据 classify() 决定退避方式或直接返回。

use std::fmt;

use thiserror::Error;

/// 上游限流错误码
pub const THROTTLING_CODE: &str = "ThrottlingException";
/// 请求参数非法
pub const VALIDATION_CODE: &str = "ValidationException";
/// 知识库等资源不存在
pub const NOT_FOUND_CODE: &str = "ResourceNotFoundException";
/// 凭证或权限不足
pub const ACCESS_DENIED_CODE: &str = "AccessDeniedException";

/// 单个聊天请求可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Missing required configuration parameters: {0}")]
    Configuration(String),

    /// 本地准入拒绝
    #[error("Rate limit exceeded. Please wait {retry_after} seconds before making another request.")]
    RateLimited { retry_after: u64 },

    /// 上游持续限流，重试耗尽
    #[error("AWS Bedrock rate limit exceeded. Please wait a few minutes before trying again.")]
    Throttled { retry_after: u64 },

    #[error("Invalid request parameters: {0}")]
    InvalidRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// 其它上游错误，已按线性退避重试后仍失败
    #[error("{0}")]
    Upstream(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// 错误大类：决定传播策略（立即返回 / 重试后返回 / 兜底）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientInput,
    Configuration,
    RateLimited,
    UpstreamRejected,
    UpstreamTransient,
    Internal,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::EmptyMessage => ErrorKind::ClientInput,
            ChatError::Configuration(_) => ErrorKind::Configuration,
            ChatError::RateLimited { .. } | ChatError::Throttled { .. } => ErrorKind::RateLimited,
            ChatError::InvalidRequest(_) | ChatError::NotFound(_) | ChatError::AccessDenied(_) => {
                ErrorKind::UpstreamRejected
            }
            ChatError::Upstream(_) => ErrorKind::UpstreamTransient,
            ChatError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 限流类错误建议的等待秒数
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ChatError::RateLimited { retry_after } | ChatError::Throttled { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }
}

/// 上游错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 指数退避重试
    Throttled,
    InvalidRequest,
    NotFound,
    AccessDenied,
    /// 线性退避重试
    Other,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Throttled | ErrorClass::Other)
    }
}

/// 单次上游调用的原始错误：服务端返回的错误码（若有）与消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamError {
    /// 服务端返回的带错误码的错误
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// 传输层 / 解析等无错误码的故障
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// 限流优先：错误码为 ThrottlingException，或消息中含 "rate"
    pub fn classify(&self) -> ErrorClass {
        let code = self.code.as_deref().unwrap_or_default();
        if code == THROTTLING_CODE || self.message.to_lowercase().contains("rate") {
            return ErrorClass::Throttled;
        }
        match code {
            VALIDATION_CODE => ErrorClass::InvalidRequest,
            NOT_FOUND_CODE => ErrorClass::NotFound,
            ACCESS_DENIED_CODE => ErrorClass::AccessDenied,
            _ => ErrorClass::Other,
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} - {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}
