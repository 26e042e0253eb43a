//! kbchat - 知识库问答网关
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误模型、按会话限流、会话存储、聊天编排
//! - **llm**: 上游知识库客户端（Bedrock / 重试包装 / 本地替身）
//! - **observability**: 日志初始化
//! - **web**: axum 路由与处理函数

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod web;
