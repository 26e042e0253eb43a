//! 上游层：知识库调用抽象与实现（Bedrock / 重试包装 / 本地替身）

pub mod bedrock;
pub mod retry;
pub mod stand_in;
pub mod traits;

pub use bedrock::{default_endpoint, BedrockClient};
pub use retry::{RetryConfig, RetryingUpstreamClient, UpstreamTarget};
pub use stand_in::{stand_in_reply, StandInResponder};
pub use traits::{Answer, ChatBackend, KnowledgeBase, RetrieveRequest, RetrieveResponse};
