//! 总线消息定义
//!
//! 每条消息带元信息（ID、收发地址、时间戳），载荷是封闭的枚举：每种类型标签一个变体，
//! 各自携带强类型字段。应答是一条新消息，通过 `in_reply_to` 引用原始请求 ID。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ClassifiedError;

/// Actor / 订阅者地址
pub type Address = String;

/// 会话键（聊天端的频道 / 私聊 ID）
pub type ConversationId = String;

/// 附件描述（下载与预览生成由外部完成，这里只负责拼进提示词）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    /// 文本预览（可选，拼接时按字符预算截断）
    pub text_preview: Option<String>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            filename: filename.into(),
            size_bytes,
            content_type: None,
            text_preview: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.text_preview = Some(preview.into());
        self
    }
}

/// 流式增量：纯文本与工具输出分开转发
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum StreamDelta {
    Text(String),
    ToolOutput(String),
}

/// 消息载荷（按类型标签区分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// 用户输入
    Content {
        conversation: ConversationId,
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },

    /// `!retry` 命令；automatic 表示由冷却计时器触发
    Retry {
        conversation: ConversationId,
        #[serde(default)]
        automatic: bool,
    },

    /// 流式开始
    StreamStarted {
        conversation: ConversationId,
        request_id: String,
        agent_session: Option<String>,
    },

    /// 流式增量
    StreamPartial {
        conversation: ConversationId,
        request_id: String,
        delta: StreamDelta,
    },

    /// 流式结束，携带完整文本
    StreamCompleted {
        conversation: ConversationId,
        request_id: String,
        text: String,
    },

    /// 流式失败
    StreamError {
        conversation: ConversationId,
        request_id: String,
        fatal: bool,
        error: Option<ClassifiedError>,
        notice: Option<String>,
    },

    /// 非致命提示（正在重试 / 没有可重试的请求 / 冷却结束）
    Notice {
        conversation: ConversationId,
        text: String,
    },

    /// Agent 最终回复
    Reply {
        conversation: ConversationId,
        text: String,
    },

    /// 请求失败的结构化应答
    Error {
        conversation: ConversationId,
        message: String,
        fatal: bool,
        classified: Option<ClassifiedError>,
    },
}

impl MessageBody {
    /// 类型标签
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Content { .. } => "content",
            MessageBody::Retry { .. } => "retry",
            MessageBody::StreamStarted { .. } => "stream_started",
            MessageBody::StreamPartial { .. } => "stream_partial",
            MessageBody::StreamCompleted { .. } => "stream_completed",
            MessageBody::StreamError { .. } => "stream_error",
            MessageBody::Notice { .. } => "notice",
            MessageBody::Reply { .. } => "reply",
            MessageBody::Error { .. } => "error",
        }
    }

    pub fn conversation(&self) -> &str {
        match self {
            MessageBody::Content { conversation, .. }
            | MessageBody::Retry { conversation, .. }
            | MessageBody::StreamStarted { conversation, .. }
            | MessageBody::StreamPartial { conversation, .. }
            | MessageBody::StreamCompleted { conversation, .. }
            | MessageBody::StreamError { conversation, .. }
            | MessageBody::Notice { conversation, .. }
            | MessageBody::Reply { conversation, .. }
            | MessageBody::Error { conversation, .. } => conversation,
        }
    }
}

/// 总线消息（带元信息）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: Address,
    pub to: Address,
    /// 应答所引用的原始请求 ID
    pub in_reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(from: impl Into<Address>, to: impl Into<Address>, body: MessageBody) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            in_reply_to: None,
            created_at: Utc::now(),
            body,
        }
    }

    /// 构造对本消息的应答（收发地址互换）
    pub fn reply(&self, body: MessageBody) -> Self {
        Self {
            in_reply_to: Some(self.id.clone()),
            ..Self::new(self.to.clone(), self.from.clone(), body)
        }
    }

    /// 复制载荷并换一个新 ID（重试时使用）
    pub fn with_fresh_id(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn conversation(&self) -> &str {
        self.body.conversation()
    }

    /// 应答所对应的原始请求 ID；非应答消息返回自身 ID
    pub fn origin_id(&self) -> &str {
        self.in_reply_to.as_deref().unwrap_or(&self.id)
    }

    pub fn content(
        from: impl Into<Address>,
        to: impl Into<Address>,
        conversation: impl Into<ConversationId>,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self::new(
            from,
            to,
            MessageBody::Content {
                conversation: conversation.into(),
                text: text.into(),
                attachments,
            },
        )
    }

    pub fn retry(
        from: impl Into<Address>,
        to: impl Into<Address>,
        conversation: impl Into<ConversationId>,
    ) -> Self {
        Self::new(
            from,
            to,
            MessageBody::Retry {
                conversation: conversation.into(),
                automatic: false,
            },
        )
    }
}
