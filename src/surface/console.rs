//! 终端聊天端：把消息打印到 stdout，句柄为自增序号

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::traits::{ChatSurface, MessageHandle};

#[derive(Debug, Default)]
pub struct ConsoleSurface {
    next_id: AtomicU64,
}

impl ConsoleSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatSurface for ConsoleSurface {
    async fn send(&self, conversation: &str, text: &str) -> anyhow::Result<MessageHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        println!("[{conversation} #{id}] {text}");
        Ok(MessageHandle::new(conversation, id.to_string()))
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> anyhow::Result<()> {
        println!("[{} #{} edited] {}", handle.conversation, handle.id, text);
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> anyhow::Result<()> {
        println!("[{} #{} deleted]", handle.conversation, handle.id);
        Ok(())
    }
}
