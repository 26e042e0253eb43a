//! Bedrock Agent Runtime RetrieveAndGenerate 客户端
//!
//! 通过 reqwest 调用 REST 端点。配置了 IAM 访问密钥时请求按 SigV4 签名，否则使用 Bearer 方式的 Bedrock API Key；
//! 错误码取自 x-amzn-ErrorType 头或响应体的 __type / code。

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{UpstreamError, THROTTLING_CODE};
use crate::llm::{KnowledgeBase, RetrieveRequest, RetrieveResponse};

/// 根据区域拼出默认端点
pub fn default_endpoint(region: &str) -> String {
    format!("https://bedrock-agent-runtime.{}.amazonaws.com", region)
}

/// SigV4 签名使用的服务名
const SIGNING_NAME: &str = "bedrock";

struct SigV4 {
    identity: Identity,
    region: String,
}

pub struct BedrockClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    sigv4: Option<SigV4>,
}

impl BedrockClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<&str>,
        timeout_secs: u64,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| UpstreamError::transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()).map(String::from),
            sigv4: None,
        })
    }

    /// 改用 IAM 凭证对请求做 SigV4 签名（优先于 API Key）
    pub fn with_aws_credentials(mut self, credentials: Credentials, region: &str) -> Self {
        self.sigv4 = Some(SigV4 {
            identity: credentials.into(),
            region: region.to_string(),
        });
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn auth_scheme(&self) -> &'static str {
        match (&self.sigv4, &self.api_key) {
            (Some(_), _) => "sigv4",
            (None, Some(_)) => "bearer",
            (None, None) => "none",
        }
    }
}

/// 计算 SigV4 签名后需要附加的请求头（authorization、x-amz-date 等）
fn sign_request(
    signer: &SigV4,
    url: &str,
    body: &[u8],
    time: SystemTime,
) -> Result<Vec<(String, String)>, UpstreamError> {
    let signing_failed = |e: &dyn std::fmt::Display| {
        UpstreamError::transport(format!("request signing failed: {}", e))
    };

    let params = v4::SigningParams::builder()
        .identity(&signer.identity)
        .region(&signer.region)
        .name(SIGNING_NAME)
        .time(time)
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| signing_failed(&e))?
        .into();

    let headers = [(CONTENT_TYPE.as_str(), "application/json")];
    let signable = SignableRequest::new(
        "POST",
        url,
        headers.into_iter(),
        SignableBody::Bytes(body),
    )
    .map_err(|e| signing_failed(&e))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| signing_failed(&e))?
        .into_parts();

    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect())
}

// 线上报文结构（camelCase）

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    input: WireInput<'a>,
    retrieve_and_generate_configuration: WireConfiguration<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Serialize)]
struct WireInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireConfiguration<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    knowledge_base_configuration: WireKnowledgeBase<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireKnowledgeBase<'a> {
    knowledge_base_id: &'a str,
    model_arn: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    output: WireOutput,
    #[serde(default)]
    citations: Vec<Value>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct WireOutput {
    #[serde(default)]
    text: String,
}

impl<'a> From<&'a RetrieveRequest> for WireRequest<'a> {
    fn from(r: &'a RetrieveRequest) -> Self {
        Self {
            input: WireInput { text: &r.query },
            retrieve_and_generate_configuration: WireConfiguration {
                kind: "KNOWLEDGE_BASE",
                knowledge_base_configuration: WireKnowledgeBase {
                    knowledge_base_id: &r.knowledge_base_id,
                    model_arn: &r.model_arn,
                },
            },
            session_id: r.session_id.as_deref(),
        }
    }
}

/// "com.amazonaws...#ThrottlingException" / "ThrottlingException:http://..." 都归一为 "ThrottlingException"
fn normalize_code(raw: &str) -> String {
    let raw = raw.split(':').next().unwrap_or(raw);
    raw.rsplit('#').next().unwrap_or(raw).trim().to_string()
}

/// 从失败响应中提取错误码与消息
fn parse_error(status: reqwest::StatusCode, headers: &HeaderMap, body: &str) -> UpstreamError {
    let json: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    let code = headers
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .map(normalize_code)
        .or_else(|| {
            json.get("__type")
                .or_else(|| json.get("code"))
                .and_then(Value::as_str)
                .map(normalize_code)
        })
        .filter(|c| !c.is_empty())
        .or_else(|| {
            (status == reqwest::StatusCode::TOO_MANY_REQUESTS).then(|| THROTTLING_CODE.to_string())
        });

    let message = json
        .get("message")
        .or_else(|| json.get("Message"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            }
        });

    match code {
        Some(code) => UpstreamError::service(code, message),
        None => UpstreamError::transport(format!("HTTP {}: {}", status.as_u16(), message)),
    }
}

#[async_trait]
impl KnowledgeBase for BedrockClient {
    async fn retrieve_and_generate(
        &self,
        request: &RetrieveRequest,
    ) -> Result<RetrieveResponse, UpstreamError> {
        let url = format!("{}/retrieveAndGenerate", self.endpoint);
        let body = serde_json::to_vec(&WireRequest::from(request))
            .map_err(|e| UpstreamError::transport(format!("invalid request body: {}", e)))?;

        let mut builder = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(signer) = &self.sigv4 {
            for (name, value) in sign_request(signer, &url, &body, SystemTime::now())? {
                builder = builder.header(name, value);
            }
        } else if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let builder = builder.body(body);

        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(parse_error(status, &headers, &body));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::transport(format!("invalid response body: {}", e)))?;

        Ok(RetrieveResponse {
            text: wire.output.text,
            citations: wire.citations,
            session_id: wire.session_id,
        })
    }
}
