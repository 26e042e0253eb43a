//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `KBCHAT__*` 覆盖（双下划线表示嵌套，如 `KBCHAT__RATE_LIMIT__MAX_REQUESTS=10`），
//! 最后兼容部署中常用的扁平变量名（KNOWLEDGE_BASE_ID、RATE_LIMIT_REQUESTS 等）。

use std::path::PathBuf;

use aws_credential_types::Credentials;
use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{default_endpoint, RetryConfig, UpstreamTarget};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub upstream: UpstreamSection,
    pub rate_limit: RateLimitSection,
    pub retry: RetrySection,
    pub session: SessionSection,
}

/// [app] 段：服务名、调试开关、日志级别、时区
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub debug: bool,
    pub log_level: String,
    /// 所有时间戳使用的固定时区偏移（小时）
    pub utc_offset_hours: i32,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "AI Chatbot API".to_string(),
            debug: true,
            log_level: "INFO".to_string(),
            utc_offset_hours: 4,
        }
    }
}

/// [server] 段：监听地址与 CORS 允许来源
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// [upstream] 段：知识库、区域、模型与凭证
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub knowledge_base_id: String,
    pub region: String,
    pub model_id: String,
    /// IAM 访问密钥；与 secret_access_key 同时配置时请求按 SigV4 签名
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// 临时凭证附带的会话令牌（可选）
    pub session_token: Option<String>,
    /// Bedrock API Key（Bearer），未配置访问密钥时使用
    pub api_key: Option<String>,
    /// 自定义端点（代理 / 本地网关）；未设置时按区域拼出
    pub endpoint: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            knowledge_base_id: "JGMPKF6VEI".to_string(),
            region: "us-east-1".to_string(),
            model_id: "anthropic.claude-3-sonnet-20240229-v1:0".to_string(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            api_key: None,
            endpoint: None,
            request_timeout_secs: 60,
        }
    }
}

/// [rate_limit] 段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_requests: usize,
    pub window_seconds: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window_seconds: 60,
        }
    }
}

/// [retry] 段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub throttle_cooldown_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 2,
            throttle_cooldown_secs: 120,
        }
    }
}

/// [session] 段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 会话在最后一次活跃后保留的小时数
    pub cleanup_hours: i64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self { cleanup_hours: 24 }
    }
}

impl UpstreamSection {
    fn non_empty(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        Self::non_empty(&self.api_key)
    }

    /// 访问密钥与私钥都非空时才视为配置了 IAM 凭证；凭证不会出现在任何诊断接口中
    pub fn aws_credentials(&self) -> Option<Credentials> {
        let access_key_id = Self::non_empty(&self.access_key_id)?;
        let secret_access_key = Self::non_empty(&self.secret_access_key)?;
        Some(Credentials::new(
            access_key_id,
            secret_access_key,
            Self::non_empty(&self.session_token).map(String::from),
            None,
            "kbchat-config",
        ))
    }

    /// 是否配置了可达的上游（IAM 凭证、API Key 或显式端点）
    pub fn is_configured(&self) -> bool {
        self.aws_credentials().is_some()
            || self.api_key().is_some()
            || Self::non_empty(&self.endpoint).is_some()
    }

    pub fn endpoint(&self) -> String {
        Self::non_empty(&self.endpoint)
            .map(String::from)
            .unwrap_or_else(|| default_endpoint(&self.region))
    }

    pub fn target(&self) -> UpstreamTarget {
        UpstreamTarget {
            knowledge_base_id: self.knowledge_base_id.clone(),
            region: self.region.clone(),
            model_id: self.model_id.clone(),
        }
    }
}

impl AppConfig {
    /// 部署时区；偏移非法时退回 UTC
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.app.utc_offset_hours.saturating_mul(3600))
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn retention(&self) -> Duration {
        Duration::hours(self.session.cleanup_hours.max(0))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: std::time::Duration::from_secs(self.retry.retry_delay_secs),
            throttle_cooldown_secs: self.retry.throttle_cooldown_secs,
        }
    }
}

/// 扁平环境变量 → 嵌套配置键
const FLAT_ENV_KEYS: &[(&str, &str)] = &[
    ("KNOWLEDGE_BASE_ID", "upstream.knowledge_base_id"),
    ("AWS_DEFAULT_REGION", "upstream.region"),
    ("CLAUDE_MODEL_ID", "upstream.model_id"),
    ("AWS_ACCESS_KEY_ID", "upstream.access_key_id"),
    ("AWS_SECRET_ACCESS_KEY", "upstream.secret_access_key"),
    ("AWS_SESSION_TOKEN", "upstream.session_token"),
    ("AWS_BEARER_TOKEN_BEDROCK", "upstream.api_key"),
    ("BEDROCK_ENDPOINT", "upstream.endpoint"),
    ("LOG_LEVEL", "app.log_level"),
    ("DEBUG", "app.debug"),
    ("SESSION_CLEANUP_HOURS", "session.cleanup_hours"),
    ("RATE_LIMIT_REQUESTS", "rate_limit.max_requests"),
    ("RATE_LIMIT_WINDOW", "rate_limit.window_seconds"),
    ("RETRY_DELAY", "retry.retry_delay_secs"),
    ("MAX_RETRIES", "retry.max_retries"),
    ("PORT", "server.port"),
];

/// 从 config 目录加载配置，环境变量 KBCHAT__* 与扁平变量可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 KBCHAT__*（双下划线表示嵌套键）
/// 4. 最后叠加 FLAT_ENV_KEYS 中的扁平变量，以及逗号分隔的 ALLOWED_ORIGINS
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    load_config_with(config_path, |key| std::env::var(key).ok())
}

/// 同 load_config，扁平变量通过 lookup 读取
pub fn load_config_with<F>(
    config_path: Option<PathBuf>,
    lookup: F,
) -> Result<AppConfig, config::ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("KBCHAT")
            .separator("__")
            .try_parsing(true),
    );

    for (var, key) in FLAT_ENV_KEYS {
        builder = builder.set_override_option(*key, lookup(*var))?;
    }
    let origins = lookup("ALLOWED_ORIGINS").map(|raw| {
        raw.split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect::<Vec<String>>()
    });
    builder = builder.set_override_option("server.allowed_origins", origins)?;

    let c = builder.build()?;
    c.try_deserialize()
}
