//! 外部 Agent 客户端抽象
//!
//! 契约很窄：提交一个提示词，过程中收到零到多个进度事件，最后得到完整文本；失败时返回一段自由文本描述。
//! 进度事件通过通道发送（而非回调），由调用方按到达顺序消费。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Agent 进度事件（外部进程以 JSON 行输出时使用 kebab-case 的 type 标签）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    /// 助手文本增量
    AssistantTextDelta { text: String },
    /// 工具执行结果
    ToolResult {
        #[serde(default)]
        tool: Option<String>,
        output: String,
    },
    /// Agent 会话初始化（携带可用于续接的会话 ID）
    SessionInit { session_id: String },
    /// 最终结果
    Result { text: String },
}

/// 进度事件发送端
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// 一次提交
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub conversation: String,
    pub prompt: String,
    /// 之前从 SessionInit 得知的会话 ID，用于续接上下文
    pub resume_session: Option<String>,
}

/// Agent 客户端 trait：提交提示词，返回最终文本
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// progress 为 None 时走非流式路径；实现方在返回前应丢弃发送端
    async fn submit(
        &self,
        request: AgentRequest,
        progress: Option<ProgressSender>,
    ) -> Result<String, String>;

    /// 可执行文件名（用于依赖缺失时的预检）；进程内实现返回 None
    fn program(&self) -> Option<&str> {
        None
    }
}
