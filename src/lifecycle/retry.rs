//! Issuance Retry Policy
//!
//! 発行ゲートウェイ呼び出しのリトライ戦略（指数バックオフ）

use crate::error::LifecycleError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// 指数バックオフによるリトライ戦略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 初回リトライまでの待機時間
    pub initial_delay: Duration,
    /// 待機時間の上限
    pub max_delay: Duration,
    /// 倍率
    pub multiplier: f64,
    /// 最大試行回数（初回を含む）
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// リトライしない
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `attempt` 回目の失敗後の待機時間
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = Duration::from_millis(((delay.as_millis() as f64) * self.multiplier) as u64)
                .min(self.max_delay);
        }
        delay
    }

    /// 全試行を使い切るまでの待機時間の合計
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|attempt| self.delay_after(attempt)).sum()
    }

    /// リトライ可能な操作を実行
    ///
    /// 操作には何回目の試行かが渡される。
    pub async fn execute<F, T, Fut>(&self, mut operation: F) -> Result<T, LifecycleError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, LifecycleError>> + Send,
        T: Send,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < max_attempts && Self::should_retry(&e) => {
                    let delay = self.delay_after(attempt);
                    info!(
                        "Retrying issuance with exponential backoff (attempt {}/{}), delay: {:?}",
                        attempt, max_attempts, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// ゲートウェイ失敗のみリトライする
    fn should_retry(error: &LifecycleError) -> bool {
        matches!(error, LifecycleError::GatewayFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::types::RequestId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            multiplier: 2.0,
            max_attempts: 5,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(4), Duration::from_millis(300));
        assert_eq!(policy.total_backoff(), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_retries_gateway_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let id = RequestId::new();

        let result = fast_policy(3)
            .execute(|attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(LifecycleError::GatewayFailure {
                            id,
                            attempt,
                            reason: "unavailable".to_string(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let id = RequestId::new();

        let result: Result<(), _> = fast_policy(5)
            .execute(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(LifecycleError::NotFound(id))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let id = RequestId::new();
        let result: Result<(), _> = fast_policy(2)
            .execute(|attempt| async move {
                Err(LifecycleError::GatewayFailure {
                    id,
                    attempt,
                    reason: "down".to_string(),
                })
            })
            .await;

        match result {
            Err(LifecycleError::GatewayFailure { attempt, .. }) => assert_eq!(attempt, 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
