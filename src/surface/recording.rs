//! 记录型聊天端（用于测试）：保存所有操作，可注入失败

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{ChatSurface, MessageHandle};

/// 一次聊天端操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceOp {
    Send {
        conversation: String,
        id: String,
        text: String,
    },
    Edit {
        id: String,
        text: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Debug, Default)]
pub struct RecordingSurface {
    ops: Mutex<Vec<SurfaceOp>>,
    next_id: AtomicU64,
    /// 接下来 N 次调用返回错误
    failures: AtomicUsize,
    /// 每次调用前的延迟
    latency: Duration,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟慢速网络：每次调用先等待 latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// 让接下来的 n 次调用失败（模拟限流）
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<SurfaceOp> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 所有新发送消息的文本（按顺序）
    pub fn sent_texts(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SurfaceOp::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// 所有编辑的文本（按顺序）
    pub fn edited_texts(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SurfaceOp::Edit { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    async fn check_failure(&self) -> anyhow::Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("429 Too Many Requests");
        }
        Ok(())
    }

    fn record(&self, op: SurfaceOp) {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }
}

#[async_trait]
impl ChatSurface for RecordingSurface {
    async fn send(&self, conversation: &str, text: &str) -> anyhow::Result<MessageHandle> {
        self.check_failure().await?;
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.record(SurfaceOp::Send {
            conversation: conversation.to_string(),
            id: id.clone(),
            text: text.to_string(),
        });
        Ok(MessageHandle::new(conversation, id))
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> anyhow::Result<()> {
        self.check_failure().await?;
        self.record(SurfaceOp::Edit {
            id: handle.id.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> anyhow::Result<()> {
        self.check_failure().await?;
        self.record(SurfaceOp::Delete {
            id: handle.id.clone(),
        });
        Ok(())
    }
}
