//! 进程内 Agent 客户端（用于本地演示与测试，无需外部进程）
//!
//! - EchoAgentClient：把提示词按行流式回显
//! - ScriptedAgentClient：按脚本逐次返回预设的进度事件与结果，并记录收到的请求

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::traits::{AgentClient, AgentRequest, ProgressEvent, ProgressSender};

/// 回显客户端：逐行发送 AssistantTextDelta，最终返回完整回显
#[derive(Debug, Default)]
pub struct EchoAgentClient {
    /// 每行之间的间隔，模拟真实 Agent 的输出节奏
    pub line_delay: Duration,
}

#[async_trait]
impl AgentClient for EchoAgentClient {
    async fn submit(
        &self,
        request: AgentRequest,
        progress: Option<ProgressSender>,
    ) -> Result<String, String> {
        let text = format!("Echo: {}", request.prompt);
        if let Some(tx) = progress {
            let _ = tx.send(ProgressEvent::SessionInit {
                session_id: format!("echo-{}", request.conversation),
            });
            for line in text.split_inclusive('\n') {
                if !self.line_delay.is_zero() {
                    tokio::time::sleep(self.line_delay).await;
                }
                let _ = tx.send(ProgressEvent::AssistantTextDelta {
                    text: line.to_string(),
                });
            }
        }
        Ok(text)
    }
}

/// 一次脚本化调用的结果
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub events: Vec<ProgressEvent>,
    pub outcome: Result<String, String>,
}

impl ScriptedTurn {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            outcome: Ok(text.into()),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            outcome: Err(error.into()),
        }
    }

    pub fn with_events(mut self, events: Vec<ProgressEvent>) -> Self {
        self.events = events;
        self
    }
}

/// 脚本客户端：每次调用弹出一个 ScriptedTurn，脚本用完后回显提示词
#[derive(Default)]
pub struct ScriptedAgentClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<AgentRequest>>,
    /// 设置后，调用会在返回前等待放行（用于构造「处理中」窗口）
    gate: Mutex<Option<Arc<Notify>>>,
    started: Arc<Notify>,
}

impl ScriptedAgentClient {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Self::default()
        }
    }

    /// 让下一次调用阻塞，直到返回的 Notify 被 notify_one
    pub fn hold_next(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&gate));
        gate
    }

    /// 每次调用开始时通知
    pub fn started(&self) -> Arc<Notify> {
        Arc::clone(&self.started)
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgentClient {
    async fn submit(
        &self,
        request: AgentRequest,
        progress: Option<ProgressSender>,
    ) -> Result<String, String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        self.started.notify_one();

        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let turn = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::ok(request.prompt.clone()));

        if let Some(tx) = progress {
            for event in turn.events {
                let _ = tx.send(event);
            }
        }
        turn.outcome
    }
}
