//! 额度冷却计时器
//!
//! 额度耗尽后按会话安排一个延迟任务：到期时提示用户「冷却大概结束，可以重试」，
//! 并可选地自动触发重试。每个会话至多一个待触发计时器，重新安排会取消旧的。
//!
//! 触发与取消在同一把锁下比对代次（generation），被取消的计时器即使已经醒来也不会执行回调。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

/// 冷却下限
pub const MIN_COOLDOWN: Duration = Duration::from_secs(60);
/// 冷却上限（6 小时）
pub const MAX_COOLDOWN: Duration = Duration::from_secs(6 * 3600);
/// 未给出等待时间时的默认冷却（30 分钟，仍会被钳制）
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// 计算实际冷却时长：缺省 30 分钟，并钳制到 [60s, 6h]
pub fn clamp_cooldown(retry_after: Option<Duration>) -> Duration {
    retry_after
        .unwrap_or(DEFAULT_COOLDOWN)
        .clamp(MIN_COOLDOWN, MAX_COOLDOWN)
}

struct CooldownTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// 按会话管理的冷却计时器集合
#[derive(Default)]
pub struct CooldownScheduler {
    timers: Mutex<HashMap<String, CooldownTimer>>,
    next_generation: AtomicU64,
}

impl CooldownScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 安排冷却；返回钳制后的实际延迟。旧计时器会被取消。
    pub fn schedule<F, Fut>(
        self: &Arc<Self>,
        conversation: &str,
        retry_after: Option<Duration>,
        on_fire: F,
    ) -> Duration
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = clamp_cooldown(retry_after);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let key = conversation.to_string();

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(scheduler) = scheduler.upgrade() else {
                return;
            };
            if scheduler.take_if_current(&task_key, generation) {
                tracing::info!(conversation = %task_key, "Cooldown elapsed");
                on_fire().await;
            }
        });

        if let Some(previous) = timers.insert(key, CooldownTimer { generation, handle }) {
            previous.handle.abort();
            tracing::debug!(conversation, "Replaced pending cooldown");
        }
        tracing::info!(conversation, delay_secs = delay.as_secs(), "Cooldown scheduled");
        delay
    }

    fn take_if_current(&self, conversation: &str, generation: u64) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.get(conversation) {
            Some(timer) if timer.generation == generation => {
                timers.remove(conversation);
                true
            }
            _ => false,
        }
    }

    /// 取消会话的待触发冷却，返回是否存在
    pub fn cancel(&self, conversation: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conversation);
        match removed {
            Some(timer) => {
                timer.handle.abort();
                tracing::debug!(conversation, "Cooldown cancelled");
                true
            }
            None => false,
        }
    }

    /// 取消全部计时器（停止 Actor 时调用）
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_pending(&self, conversation: &str) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(conversation)
    }

    pub fn pending_count(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
