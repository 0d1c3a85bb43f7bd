//! 装配层：按配置组装总线、Worker 与流式协调器
//!
//! 入站文本经 `submit_text` 进入总线：`!retry` 路由为重试命令，其余作为内容。
//! 所有应答与事件都广播到总线，由协调器渲染到聊天端。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentClient, CommandAgentClient, EchoAgentClient};
use crate::bus::{Actor, Attachment, ListenerId, Message, MessageBus};
use crate::config::{AgentSection, AppConfig};
use crate::core::{ErrorClassifier, PreflightProbe, RelayError, RetryOptions};
use crate::streaming::StreamingCoordinator;
use crate::surface::ChatSurface;
use crate::worker::WorkerActor;

/// 重试命令
pub const RETRY_COMMAND: &str = "!retry";

/// 聊天端在总线上的地址
pub const CHAT_ADDRESS: &str = "chat";

pub struct Relay {
    bus: Arc<MessageBus>,
    worker: Arc<WorkerActor>,
    coordinator: Arc<StreamingCoordinator>,
    listener: ListenerId,
    cancel: CancellationToken,
    coordinator_task: JoinHandle<()>,
}

impl Relay {
    /// 组装并启动（需在 tokio 运行时内调用）
    pub fn new(
        config: &AppConfig,
        agent: Arc<dyn AgentClient>,
        surface: Arc<dyn ChatSurface>,
    ) -> Self {
        let bus = Arc::new(MessageBus::new());

        let probe = agent.program().map(|program| PreflightProbe {
            program: program.to_string(),
            version_arg: config.agent.version_arg.clone(),
        });
        let worker = WorkerActor::new(
            agent,
            ErrorClassifier::new(probe),
            Some(bus.emitter()),
            config.worker.clone(),
        );
        bus.register(worker.clone());

        let coordinator = StreamingCoordinator::new(
            surface,
            config.streaming.clone(),
            RetryOptions::from(&config.retry),
        );
        let (listener, events) = bus.add_listener();
        let cancel = CancellationToken::new();
        let coordinator_task = coordinator.clone().run(events, cancel.clone());

        tracing::info!(
            worker = %config.worker.address,
            streaming = config.worker.streaming,
            mode = ?config.streaming.mode,
            "Relay started"
        );

        Self {
            bus,
            worker,
            coordinator,
            listener,
            cancel,
            coordinator_task,
        }
    }

    /// 按 [agent] 段创建客户端
    pub fn agent_from_config(config: &AgentSection) -> Arc<dyn AgentClient> {
        if config.mock {
            tracing::info!("Using in-process echo agent");
            return Arc::new(EchoAgentClient {
                line_delay: Duration::from_millis(200),
            });
        }
        Arc::new(
            CommandAgentClient::new(config.command.clone())
                .with_args(config.args.clone())
                .with_resume_arg(config.resume_arg.clone())
                .with_timeout(config.timeout()),
        )
    }

    /// 把一行用户输入转成总线消息
    pub fn parse_input(&self, conversation: &str, text: &str) -> Message {
        let to = self.worker_address();
        if text.trim().eq_ignore_ascii_case(RETRY_COMMAND) {
            Message::retry(CHAT_ADDRESS, to, conversation)
        } else {
            Message::content(CHAT_ADDRESS, to, conversation, text, Vec::new())
        }
    }

    /// 提交一行用户输入（不等待处理）
    pub async fn submit_text(&self, conversation: &str, text: &str) -> Result<(), RelayError> {
        self.bus.post(self.parse_input(conversation, text)).await
    }

    /// 提交带附件的内容
    pub async fn submit_with_attachments(
        &self,
        conversation: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(), RelayError> {
        let message = Message::content(
            CHAT_ADDRESS,
            self.worker_address(),
            conversation,
            text,
            attachments,
        );
        self.bus.post(message).await
    }

    pub fn worker_address(&self) -> &str {
        self.worker.address()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn worker(&self) -> &Arc<WorkerActor> {
        &self.worker
    }

    pub fn coordinator(&self) -> &Arc<StreamingCoordinator> {
        &self.coordinator
    }

    /// Worker 没有待处理消息且没有进行中的流式会话
    pub fn is_idle(&self) -> bool {
        let mailbox = self.worker.mailbox();
        mailbox.is_empty() && !mailbox.is_draining() && self.coordinator.session_count() == 0
    }

    /// 停止：取消冷却计时器、注销 Worker、停止协调器
    pub async fn shutdown(self) {
        tracing::info!("Shutting down relay...");
        self.worker.stop();
        self.bus.unregister(self.worker_address());
        self.bus.remove_listener(self.listener);
        self.cancel.cancel();
        if let Err(e) = self.coordinator_task.await {
            tracing::warn!(error = %e, "Coordinator task ended abnormally");
        }
    }
}
