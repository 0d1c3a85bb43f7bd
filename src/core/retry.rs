//! 指数退避重试
//!
//! 用于聊天端的 send / edit / delete 等基础设施调用，不用于 Agent 调用本身。
//! 每次失败后等待 `delay`（加随机抖动，避免多个重试同时醒来），随后 `delay *= factor`，上限 `max_delay`。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// 重试参数
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// 最大重试次数（不含首次调用）；None 表示无限重试
    pub max_retries: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// 每次等待额外叠加 [0, jitter] 的随机时长
    pub jitter: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// 第 attempt 次重试前的基础等待（attempt 从 0 开始，不含抖动）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0);
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * factor.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jitter_sample(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

/// 执行可失败操作，失败时按退避策略重试；重试次数耗尽后返回最后一次错误
pub async fn with_retry<T, E, F, Fut>(
    label: &str,
    options: &RetryOptions,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if options.max_retries.is_some_and(|max| attempt >= max) {
                    tracing::warn!(
                        label,
                        attempts = attempt + 1,
                        error = %err,
                        "Giving up after retries"
                    );
                    return Err(err);
                }
                let delay = options.backoff(attempt) + options.jitter_sample();
                attempt += 1;
                tracing::debug!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
