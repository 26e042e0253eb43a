//! 核心层：错误模型、按会话限流、会话存储、聊天编排

pub mod error;
pub mod orchestrator;
pub mod rate_limiter;
pub mod session;

pub use error::{
    ChatError, ErrorClass, ErrorKind, UpstreamError, ACCESS_DENIED_CODE, NOT_FOUND_CODE,
    THROTTLING_CODE, VALIDATION_CODE,
};
pub use orchestrator::{create_backend_from_config, ChatOrchestrator, ChatResult, TEST_QUERY};
pub use rate_limiter::{Admission, RateLimitStatus, RateLimiter, ANONYMOUS_KEY};
pub use session::{Session, SessionId, SessionStore};
