//! 单个请求的流式会话状态
//!
//! 会话以原始请求 ID 为键：收到 stream_started（或在此之前的第一条 stream_partial）时创建，
//! completed / error 时销毁。没有会话即为 Idle。

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::StreamDelta;
use crate::surface::MessageHandle;

/// 投递方式：原地编辑占位消息，或每次刷新发一条新消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Edit,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Started,
    Buffering,
    Completed,
    Errored,
}

impl SessionState {
    /// Completed / Errored：不再安排新的刷新
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }
}

/// 刷新计时器：只有等待阶段可取消，已开始的投递会跑完
#[derive(Debug)]
pub struct FlushTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    pub fn spawn<F>(interval: Duration, on_fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(interval) => on_fire.await,
            }
        });
        Self { cancel, handle }
    }

    pub fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }

    /// 取消等待；若已在投递则等它结束
    pub async fn settle(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Flush task ended abnormally");
            }
        }
    }

    /// 立即中止（停机时使用）
    pub fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[derive(Debug)]
pub struct StreamingSession {
    pub request_id: String,
    pub conversation: String,
    pub state: SessionState,
    pub mode: DeliveryMode,
    text_buffer: String,
    tool_buffer: String,
    /// 待触发的刷新任务
    pub flush_timer: Option<FlushTimer>,
    pub placeholder: Option<MessageHandle>,
}

impl StreamingSession {
    pub fn new(
        request_id: impl Into<String>,
        conversation: impl Into<String>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            conversation: conversation.into(),
            state: SessionState::Started,
            mode,
            text_buffer: String::new(),
            tool_buffer: String::new(),
            flush_timer: None,
            placeholder: None,
        }
    }

    /// 追加增量；返回是否需要安排刷新（当前没有待触发的刷新时）
    pub fn push(&mut self, delta: StreamDelta) -> bool {
        match delta {
            StreamDelta::Text(text) => self.text_buffer.push_str(&text),
            StreamDelta::ToolOutput(output) => {
                if !self.tool_buffer.is_empty() && !self.tool_buffer.ends_with('\n') {
                    self.tool_buffer.push('\n');
                }
                self.tool_buffer.push_str(&output);
            }
        }
        if !self.state.is_terminal() {
            self.state = SessionState::Buffering;
        }
        self.flush_timer.is_none() && !self.state.is_terminal()
    }

    pub fn has_pending(&self) -> bool {
        !self.text_buffer.is_empty() || !self.tool_buffer.is_empty()
    }

    /// 取出缓冲内容并清空：工具输出在前，文本在后，两者都有时以空行分隔；裁剪后为空返回 None
    pub fn take_pending(&mut self) -> Option<String> {
        let tool = std::mem::take(&mut self.tool_buffer);
        let text = std::mem::take(&mut self.text_buffer);
        let (tool, text) = (tool.trim(), text.trim());
        let combined = match (tool.is_empty(), text.is_empty()) {
            (true, true) => return None,
            (false, true) => tool.to_string(),
            (true, false) => text.to_string(),
            (false, false) => format!("{tool}\n\n{text}"),
        };
        Some(combined)
    }

    /// 进入终态并交出刷新计时器，由调用方等待它结束
    pub fn finish(&mut self, state: SessionState) -> Option<FlushTimer> {
        self.state = state;
        self.flush_timer.take()
    }

    /// 中止刷新（不等待进行中的投递）
    pub fn abort_flush(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }
}
