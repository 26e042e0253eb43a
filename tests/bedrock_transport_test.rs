//! Bedrock REST 传输层测试（wiremock 模拟上游）

use std::sync::Arc;
use std::time::Duration;

use aws_credential_types::Credentials;
use kbchat::core::{ChatError, THROTTLING_CODE};
use kbchat::llm::{
    BedrockClient, ChatBackend, KnowledgeBase, RetrieveRequest, RetryConfig,
    RetryingUpstreamClient, UpstreamTarget,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(session_id: Option<&str>) -> RetrieveRequest {
    RetrieveRequest {
        query: "What is the refund policy?".into(),
        knowledge_base_id: "KB123".into(),
        model_arn: "arn:aws:bedrock:us-east-1::foundation-model/anthropic.claude-3-sonnet-20240229-v1:0"
            .into(),
        session_id: session_id.map(String::from),
    }
}

fn target() -> UpstreamTarget {
    UpstreamTarget {
        knowledge_base_id: "KB123".into(),
        region: "us-east-1".into(),
        model_id: "anthropic.claude-3-sonnet-20240229-v1:0".into(),
    }
}

#[tokio::test]
async fn test_retrieve_and_generate_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/retrieveAndGenerate"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "input": {"text": "What is the refund policy?"},
            "retrieveAndGenerateConfiguration": {
                "type": "KNOWLEDGE_BASE",
                "knowledgeBaseConfiguration": {"knowledgeBaseId": "KB123"}
            },
            "sessionId": "bedrock-sess-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": {"text": "Refunds are issued within 30 days."},
            "citations": [{"retrievedReferences": []}],
            "sessionId": "bedrock-sess-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BedrockClient::new(&server.uri(), Some("test-key"), 5).unwrap();
    let response = client
        .retrieve_and_generate(&request(Some("bedrock-sess-1")))
        .await
        .unwrap();

    assert_eq!(response.text, "Refunds are issued within 30 days.");
    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.session_id.as_deref(), Some("bedrock-sess-1"));
}

#[tokio::test]
async fn test_access_keys_sign_request_with_sigv4() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/retrieveAndGenerate"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(header("x-amz-security-token", "session-token"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": {"text": "Signed."}
        })))
        .expect(1)
        .mount(&server)
        .await;

    // 同时配置了 API Key 时仍以 SigV4 为准
    let client = BedrockClient::new(&server.uri(), Some("ignored-key"), 5)
        .unwrap()
        .with_aws_credentials(
            Credentials::new(
                "AKIATEST",
                "secret",
                Some("session-token".to_string()),
                None,
                "test",
            ),
            "eu-west-1",
        );
    let response = client.retrieve_and_generate(&request(None)).await.unwrap();
    assert_eq!(response.text, "Signed.");
    assert_eq!(response.session_id, None);

    let received = server.received_requests().await.unwrap();
    let auth = received[0]
        .headers
        .get("authorization")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIATEST/"), "{}", auth);
    assert!(auth.contains("/eu-west-1/bedrock/aws4_request"), "{}", auth);
    assert!(auth.contains("SignedHeaders="), "{}", auth);
    assert!(auth.contains("Signature="), "{}", auth);
    assert!(!auth.contains("ignored-key"));
}

#[tokio::test]
async fn test_service_error_code_from_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/retrieveAndGenerate"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("x-amzn-ErrorType", "ValidationException:http://internal/")
                .set_body_json(json!({"message": "Input text is too long"})),
        )
        .mount(&server)
        .await;

    let client = BedrockClient::new(&server.uri(), None, 5).unwrap();
    let err = client.retrieve_and_generate(&request(None)).await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("ValidationException"));
    assert_eq!(err.message, "Input text is too long");
}

#[tokio::test]
async fn test_too_many_requests_without_code_is_throttling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/retrieveAndGenerate"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = BedrockClient::new(&server.uri(), None, 5).unwrap();
    let err = client.retrieve_and_generate(&request(None)).await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some(THROTTLING_CODE));
}

#[tokio::test]
async fn test_retrying_client_recovers_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/retrieveAndGenerate"))
        .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/retrieveAndGenerate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": {"text": "Second time lucky."},
            "sessionId": "bedrock-sess-9"
        })))
        .mount(&server)
        .await;

    let client = BedrockClient::new(&server.uri(), None, 5).unwrap();
    let retrying = RetryingUpstreamClient::new(
        Arc::new(client),
        target(),
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            throttle_cooldown_secs: 120,
        },
    );

    let answer = retrying.invoke("hello", None).await.unwrap();
    assert_eq!(answer.text, "Second time lucky.");
    assert_eq!(answer.upstream_session_id.as_deref(), Some("bedrock-sess-9"));
    assert!(!answer.stand_in);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_retrying_client_does_not_retry_access_denied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/retrieveAndGenerate"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "__type": "AccessDeniedException",
            "message": "User is not authorized"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BedrockClient::new(&server.uri(), Some("k"), 5).unwrap();
    let retrying = RetryingUpstreamClient::new(Arc::new(client), target(), RetryConfig::default());

    let err = retrying.invoke("hello", None).await.unwrap_err();
    assert_eq!(err, ChatError::AccessDenied("User is not authorized".into()));
}
