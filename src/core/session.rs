//! 会话管理
//!
//! 会话只保存在进程内存中：首次消息时创建，上游返回续接 ID 时重新绑定，每轮对话更新活跃时间与计数，
//! 删除 / 清空 / 过期清理时一并清除对应的限流窗口。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::rate_limiter::RateLimiter;

/// 会话 ID（本地生成的 UUID，或上游签发的续接 ID）
pub type SessionId = String;

/// 单个会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    #[serde(rename = "session_id")]
    pub id: SessionId,
    pub created_at: DateTime<FixedOffset>,
    pub last_activity: DateTime<FixedOffset>,
    pub message_count: u64,
    /// 仅当该 ID 由上游签发时为 true；本地生成的 ID 不能作为续接 ID 发给上游
    #[serde(skip)]
    pub has_upstream_binding: bool,
}

impl Session {
    fn new(id: SessionId, now: DateTime<FixedOffset>) -> Self {
        Self {
            id,
            created_at: now,
            last_activity: now,
            message_count: 1,
            has_upstream_binding: false,
        }
    }

    /// 记录一轮对话；活跃时间只前进不后退
    fn touch(&mut self, now: DateTime<FixedOffset>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
        self.message_count += 1;
    }

    pub fn is_expired(&self, now: DateTime<FixedOffset>, retention: Duration) -> bool {
        now - self.last_activity > retention
    }
}

/// 会话存储：独占会话映射，并在删除时同步清理限流窗口
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    rate_limiter: Arc<RateLimiter>,
    offset: FixedOffset,
    retention: Duration,
}

impl SessionStore {
    pub fn new(rate_limiter: Arc<RateLimiter>, offset: FixedOffset, retention: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rate_limiter,
            offset,
            retention,
        }
    }

    /// 部署统一时区下的当前时间
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// 已知 ID：更新活跃时间与计数并原样返回；否则生成新会话
    pub async fn resolve_or_create(&self, id: Option<&str>) -> SessionId {
        let now = self.now();
        let mut sessions = self.sessions.write().await;

        if let Some(session) = id.and_then(|id| sessions.get_mut(id)) {
            session.touch(now);
            return session.id.clone();
        }

        let session_id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(session_id.clone(), Session::new(session_id.clone(), now));
        tracing::debug!("created session {}", session_id);
        session_id
    }

    /// 记录上游签发的续接 ID；已存在的记录保留计数与创建时间，只标记绑定
    pub async fn bind_upstream(&self, id: &str, created_at: Option<DateTime<FixedOffset>>) {
        let now = self.now();
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            let mut session = Session::new(id.to_string(), now);
            if let Some(created_at) = created_at.filter(|c| *c <= now) {
                session.created_at = created_at;
            }
            session
        });
        session.has_upstream_binding = true;
        if now > session.last_activity {
            session.last_activity = now;
        }
    }

    /// 只更新已存在的会话；会话已被删除或清理时返回 false，不会新建
    pub async fn touch(&self, id: &str) -> bool {
        let now = self.now();
        match self.sessions.write().await.get_mut(id) {
            Some(session) => {
                session.touch(now);
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// 删除会话及其限流窗口；不存在时返回 false
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            self.rate_limiter.forget_all([id]).await;
        }
        removed
    }

    /// 清空全部会话与限流窗口，返回清除的会话数
    pub async fn clear(&self) -> usize {
        let count = {
            let mut sessions = self.sessions.write().await;
            let count = sessions.len();
            sessions.clear();
            count
        };
        self.rate_limiter.clear().await;
        count
    }

    /// 按创建时间排序的会话快照
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 移除 last_activity 早于保留期的会话，并立即清理其限流窗口
    pub async fn sweep(&self, now: DateTime<FixedOffset>, retention: Duration) -> Vec<SessionId> {
        let removed: Vec<SessionId> = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<SessionId> = sessions
                .values()
                .filter(|s| s.is_expired(now, retention))
                .map(|s| s.id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            expired
        };

        if !removed.is_empty() {
            self.rate_limiter
                .forget_all(removed.iter().map(String::as_str))
                .await;
            tracing::info!("Cleaned up {} old sessions", removed.len());
        }
        removed
    }

    /// 以当前时间与配置的保留期清理
    pub async fn sweep_expired(&self) -> Vec<SessionId> {
        self.sweep(self.now(), self.retention).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn store() -> (SessionStore, Arc<RateLimiter>) {
        let limiter = Arc::new(RateLimiter::new(5, 60));
        let offset = FixedOffset::east_opt(4 * 3600).unwrap();
        (
            SessionStore::new(limiter.clone(), offset, Duration::hours(24)),
            limiter,
        )
    }

    #[tokio::test]
    async fn test_new_sessions_get_distinct_ids() {
        let (store, _) = store();
        let a = store.resolve_or_create(None).await;
        let b = store.resolve_or_create(None).await;
        assert_ne!(a, b);
        assert_eq!(store.active_count().await, 2);

        let session = store.get(&a).await.unwrap();
        assert_eq!(session.message_count, 1);
        assert!(!session.has_upstream_binding);
        assert_eq!(session.created_at, session.last_activity);
        assert_eq!(session.created_at.offset().local_minus_utc(), 4 * 3600);
    }

    #[tokio::test]
    async fn test_known_id_is_bumped() {
        let (store, _) = store();
        let id = store.resolve_or_create(None).await;
        let before = store.get(&id).await.unwrap();

        let again = store.resolve_or_create(Some(&id)).await;
        assert_eq!(again, id);
        let after = store.get(&id).await.unwrap();
        assert_eq!(after.message_count, 2);
        assert!(after.last_activity >= before.last_activity);
        assert!(after.last_activity >= after.created_at);

        store.resolve_or_create(Some(&id)).await;
        assert_eq!(store.get(&id).await.unwrap().message_count, 3);
    }

    #[tokio::test]
    async fn test_touch_never_recreates_deleted_session() {
        let (store, _) = store();
        let id = store.resolve_or_create(None).await;
        assert!(store.touch(&id).await);
        assert_eq!(store.get(&id).await.unwrap().message_count, 2);

        assert!(store.delete(&id).await);
        assert!(!store.touch(&id).await);
        assert_eq!(store.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_id_mints_fresh_session() {
        let (store, _) = store();
        let id = store.resolve_or_create(Some("not-a-session")).await;
        assert_ne!(id, "not-a-session");
        assert!(!store.contains("not-a-session").await);
    }

    #[tokio::test]
    async fn test_bind_upstream() {
        let (store, _) = store();
        let created = store.now() - Duration::minutes(5);
        store.bind_upstream("bedrock-abc", Some(created)).await;

        let session = store.get("bedrock-abc").await.unwrap();
        assert!(session.has_upstream_binding);
        assert_eq!(session.created_at, created);
        assert_eq!(session.message_count, 1);

        store.resolve_or_create(Some("bedrock-abc")).await;
        store.bind_upstream("bedrock-abc", None).await;
        let session = store.get("bedrock-abc").await.unwrap();
        assert!(session.has_upstream_binding);
        assert_eq!(session.message_count, 2);
        assert_eq!(session.created_at, created);
    }

    #[tokio::test]
    async fn test_delete_removes_rate_window() {
        let (store, limiter) = store();
        let id = store.resolve_or_create(None).await;
        limiter.admit(&id, Instant::now()).await;

        assert!(store.delete(&id).await);
        assert!(!limiter.contains(&id).await);
        assert!(!store.delete(&id).await);
    }

    #[tokio::test]
    async fn test_clear_then_list_is_empty() {
        let (store, limiter) = store();
        for _ in 0..3 {
            let id = store.resolve_or_create(None).await;
            limiter.admit(&id, Instant::now()).await;
        }
        limiter.admit("anonymous", Instant::now()).await;

        assert_eq!(store.clear().await, 3);
        assert!(store.list().await.is_empty());
        assert_eq!(limiter.tracked_keys().await, 0);
        assert_eq!(store.clear().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_sessions_and_windows() {
        let (store, limiter) = store();
        let stale = store.resolve_or_create(None).await;
        let fresh = store.resolve_or_create(None).await;
        limiter.admit(&stale, Instant::now()).await;
        limiter.admit(&fresh, Instant::now()).await;

        let now = store.now() + Duration::hours(12);
        assert!(store.sweep(now, Duration::hours(24)).await.is_empty());

        store.resolve_or_create(Some(&fresh)).await;
        let later = store.now() + Duration::hours(25);
        // fresh 的活跃时间也早于 later - 24h，两者都过期
        let removed = store.sweep(later, Duration::hours(24)).await;
        assert_eq!(removed.len(), 2);
        assert!(store.list().await.is_empty());
        assert!(!limiter.contains(&stale).await);
        assert!(!limiter.contains(&fresh).await);
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_sessions() {
        let (store, limiter) = store();
        let id = store.resolve_or_create(None).await;
        limiter.admit(&id, Instant::now()).await;

        let removed = store.sweep(store.now() + Duration::hours(1), Duration::hours(24)).await;
        assert!(removed.is_empty());
        assert_eq!(store.list().await.len(), 1);
        assert!(limiter.contains(&id).await);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_creation() {
        let (store, _) = store();
        let first = store.resolve_or_create(None).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.resolve_or_create(None).await;

        let ids: Vec<_> = store.list().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first, second]);
    }
}
