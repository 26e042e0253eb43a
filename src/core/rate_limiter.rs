//! 按 key 的固定窗口限流
//!
//! 每个 key（会话 ID 或 anonymous）保存窗口内的准入时间戳；每次判定前先剔除超出窗口的记录。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

/// 未关联会话的调用方共用的限流 key
pub const ANONYMOUS_KEY: &str = "anonymous";

/// 一次准入判定的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// 拒绝时建议等待的秒数（>= 1）；放行时为 0
    pub retry_after: u64,
}

/// 只读查询结果（不占用配额）
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub retry_after: u64,
    pub current_requests: usize,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_seconds: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window: Duration::from_secs(window_seconds),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window_seconds(&self) -> u64 {
        self.window.as_secs()
    }

    /// 判定 key 现在能否发起请求；放行时记录本次时间戳
    pub async fn admit(&self, key: &str, now: Instant) -> Admission {
        let mut windows = self.windows.lock().await;
        let timestamps = windows.entry(key.to_string()).or_default();
        self.prune(timestamps, now);

        if timestamps.len() >= self.max_requests {
            return Admission {
                allowed: false,
                retry_after: self.retry_after(timestamps, now),
            };
        }

        timestamps.push_back(now);
        Admission {
            allowed: true,
            retry_after: 0,
        }
    }

    /// 查询 key 的当前状态：会剔除过期记录，但不记录新的准入
    pub async fn status(&self, key: &str, now: Instant) -> RateLimitStatus {
        let mut windows = self.windows.lock().await;
        let current_requests = match windows.get_mut(key) {
            Some(timestamps) => {
                self.prune(timestamps, now);
                timestamps.len()
            }
            None => 0,
        };
        let allowed = current_requests < self.max_requests;
        let retry_after = match windows.get(key) {
            Some(timestamps) if !allowed => self.retry_after(timestamps, now),
            None if !allowed => self.window.as_secs().max(1),
            _ => 0,
        };
        RateLimitStatus {
            allowed,
            retry_after,
            current_requests,
        }
    }

    /// 清除 key 的窗口；返回此前是否存在记录
    pub async fn reset(&self, key: &str) -> bool {
        self.windows.lock().await.remove(key).is_some()
    }

    /// 批量清除（会话过期 / 删除时调用）
    pub async fn forget_all<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut windows = self.windows.lock().await;
        for key in keys {
            windows.remove(key);
        }
    }

    pub async fn clear(&self) -> usize {
        let mut windows = self.windows.lock().await;
        let count = windows.len();
        windows.clear();
        count
    }

    /// 当前持有窗口的 key 数量（健康检查中展示）
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, key: &str) -> bool {
        self.windows.lock().await.contains_key(key)
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) < self.window {
                break;
            }
            timestamps.pop_front();
        }
    }

    fn retry_after(&self, timestamps: &VecDeque<Instant>, now: Instant) -> u64 {
        let elapsed = timestamps
            .front()
            .map(|oldest| now.saturating_duration_since(*oldest).as_secs())
            .unwrap_or(0);
        self.window.as_secs().saturating_sub(elapsed).max(1)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(5, 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(3, 60);
        let t0 = Instant::now();

        for i in 0..3 {
            let a = limiter.admit("s1", t0 + Duration::from_secs(i)).await;
            assert!(a.allowed, "request {} should be admitted", i);
            assert_eq!(a.retry_after, 0);
        }

        let denied = limiter.admit("s1", t0 + Duration::from_secs(10)).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, 50);
    }

    #[tokio::test]
    async fn test_retry_after_is_honored() {
        let limiter = RateLimiter::new(2, 60);
        let t0 = Instant::now();
        limiter.admit("k", t0).await;
        limiter.admit("k", t0 + Duration::from_millis(1500)).await;

        let now = t0 + Duration::from_millis(20_700);
        let denied = limiter.admit("k", now).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after >= 1 && denied.retry_after <= 60);

        let later = now + Duration::from_secs(denied.retry_after);
        assert!(limiter.admit("k", later).await.allowed);
    }

    #[tokio::test]
    async fn test_retry_after_never_below_one() {
        let limiter = RateLimiter::new(1, 60);
        let t0 = Instant::now();
        limiter.admit("k", t0).await;

        let denied = limiter
            .admit("k", t0 + Duration::from_millis(59_900))
            .await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, 60);
        let t0 = Instant::now();
        assert!(limiter.admit("a", t0).await.allowed);
        assert!(!limiter.admit("a", t0).await.allowed);
        assert!(limiter.admit("b", t0).await.allowed);
        assert!(limiter.admit(ANONYMOUS_KEY, t0).await.allowed);
    }

    #[tokio::test]
    async fn test_denied_request_is_not_recorded() {
        let limiter = RateLimiter::new(1, 60);
        let t0 = Instant::now();
        limiter.admit("k", t0).await;
        for i in 1..5 {
            limiter.admit("k", t0 + Duration::from_secs(i)).await;
        }
        let status = limiter.status("k", t0 + Duration::from_secs(5)).await;
        assert_eq!(status.current_requests, 1);
    }

    #[tokio::test]
    async fn test_status_does_not_consume_quota() {
        let limiter = RateLimiter::new(2, 60);
        let t0 = Instant::now();

        let status = limiter.status("k", t0).await;
        assert!(status.allowed);
        assert_eq!(status.current_requests, 0);
        assert!(!limiter.contains("k").await);

        limiter.admit("k", t0).await;
        for _ in 0..5 {
            let status = limiter.status("k", t0).await;
            assert!(status.allowed);
            assert_eq!(status.current_requests, 1);
        }
        assert!(limiter.admit("k", t0).await.allowed);

        let status = limiter.status("k", t0 + Duration::from_secs(30)).await;
        assert!(!status.allowed);
        assert_eq!(status.retry_after, 30);
    }

    #[tokio::test]
    async fn test_reset_and_clear() {
        let limiter = RateLimiter::new(1, 60);
        let t0 = Instant::now();
        limiter.admit("a", t0).await;
        limiter.admit("b", t0).await;

        assert!(limiter.reset("a").await);
        assert!(!limiter.reset("a").await);
        assert!(limiter.admit("a", t0).await.allowed);

        limiter.forget_all(["a"]).await;
        assert!(!limiter.contains("a").await);

        assert_eq!(limiter.clear().await, 1);
        assert_eq!(limiter.tracked_keys().await, 0);
    }
}
