//! 聊天端抽象：发送 / 编辑 / 删除
//!
//! 每个操作都可能失败（限流、网络），调用方统一用 `with_retry` 包一层。

use async_trait::async_trait;

/// 已发送消息的句柄（用于后续编辑或删除）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub conversation: String,
    pub id: String,
}

impl MessageHandle {
    pub fn new(conversation: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            conversation: conversation.into(),
            id: id.into(),
        }
    }
}

/// 聊天端
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// 发送一条新消息
    async fn send(&self, conversation: &str, text: &str) -> anyhow::Result<MessageHandle>;

    /// 原地编辑已发送的消息
    async fn edit(&self, handle: &MessageHandle, text: &str) -> anyhow::Result<()>;

    async fn delete(&self, handle: &MessageHandle) -> anyhow::Result<()>;
}
