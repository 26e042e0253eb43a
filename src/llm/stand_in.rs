//! 本地替身应答（未配置上游时使用）
//!
//! 有序的 (关键词, 匹配方式, 回复) 表，按顺序做不区分大小写的匹配，首个命中生效；都不命中时回显原始输入。
//! 主关键词按子串匹配；问候别名 "hi" 只按整词匹配，否则 "this"、"which" 之类的普通词都会被当成问候。

use async_trait::async_trait;

use crate::core::{ChatError, Session};
use crate::llm::{Answer, ChatBackend};

const GREETING: &str = "Hello! I'm your AI assistant. I'm currently running in demo mode since AWS Bedrock is not configured.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Substring,
    Word,
}

impl Match {
    fn matches(self, lowered: &str, keyword: &str) -> bool {
        match self {
            Match::Substring => lowered.contains(keyword),
            Match::Word => lowered
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == keyword),
        }
    }
}

/// 关键词表；"hi" 放在最后，避免抢占其它关键词
const REPLIES: &[(&str, Match, &str)] = &[
    ("hello", Match::Substring, GREETING),
    (
        "help",
        Match::Substring,
        "I can help you with various questions. However, I'm currently in mock mode - please configure AWS Bedrock for full functionality.",
    ),
    (
        "status",
        Match::Substring,
        "I'm running in mock mode. The knowledge base integration requires proper AWS Bedrock configuration.",
    ),
    (
        "test",
        Match::Substring,
        "This is a test response from mock mode. Configure AWS Bedrock to connect to your knowledge base.",
    ),
    (
        "rate",
        Match::Substring,
        "In mock mode, there are no rate limits. This simulates a successful response without calling AWS Bedrock.",
    ),
    ("hi", Match::Word, GREETING),
];

/// 生成替身回复（纯函数，结果只取决于输入）
pub fn stand_in_reply(query: &str) -> String {
    let lowered = query.to_lowercase();
    REPLIES
        .iter()
        .find(|(keyword, mode, _)| mode.matches(&lowered, keyword))
        .map(|(_, _, reply)| reply.to_string())
        .unwrap_or_else(|| {
            format!(
                "I received your message: '{}'. I'm currently running in mock mode since the AWS Bedrock knowledge base is not available. Please configure your AWS credentials and ensure the knowledge base is properly set up.",
                query
            )
        })
}

/// 替身后端：总是成功、无引用、不重试
#[derive(Debug, Default)]
pub struct StandInResponder;

#[async_trait]
impl ChatBackend for StandInResponder {
    async fn invoke(&self, query: &str, _session: Option<&Session>) -> Result<Answer, ChatError> {
        tracing::info!("Bedrock client not available, using mock response");
        Ok(Answer {
            text: stand_in_reply(query),
            citations: Vec::new(),
            upstream_session_id: None,
            stand_in: true,
        })
    }

    fn is_stand_in(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "stand-in"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting() {
        assert_eq!(stand_in_reply("hello"), GREETING);
        assert_eq!(stand_in_reply("HeLLo there"), GREETING);
        assert_eq!(stand_in_reply("hi"), GREETING);
    }

    #[test]
    fn test_first_match_wins() {
        // "hello" 在表中先于 "help"
        assert_eq!(stand_in_reply("hello, I need help"), GREETING);
        assert!(stand_in_reply("need help with status").contains("various questions"));
        assert!(stand_in_reply("what is the STATUS").contains("running in mock mode"));
        assert!(stand_in_reply("run a test").contains("test response"));
        assert!(stand_in_reply("rate limits?").contains("no rate limits"));
    }

    #[test]
    fn test_greeting_alias_matches_whole_word_only() {
        assert_eq!(stand_in_reply("Hi there"), GREETING);
        assert_eq!(stand_in_reply("oh, hi!"), GREETING);

        for query in ["What is this?", "Which plan covers shipping?", "anything new"] {
            let reply = stand_in_reply(query);
            assert!(
                reply.starts_with(&format!("I received your message: '{}'.", query)),
                "{} -> {}",
                query,
                reply
            );
        }
    }

    #[test]
    fn test_default_echoes_query() {
        let reply = stand_in_reply("xyz-unrelated");
        assert!(reply.starts_with("I received your message: 'xyz-unrelated'."));
        assert_eq!(reply, stand_in_reply("xyz-unrelated"));
    }

    #[tokio::test]
    async fn test_responder_is_flagged_and_has_no_citations() {
        let responder = StandInResponder;
        let answer = responder.invoke("hello", None).await.unwrap();
        assert_eq!(answer.text, GREETING);
        assert!(answer.stand_in);
        assert!(answer.citations.is_empty());
        assert!(answer.upstream_session_id.is_none());
        assert!(responder.is_stand_in());
        assert!(responder.preflight().is_ok());
    }
}
