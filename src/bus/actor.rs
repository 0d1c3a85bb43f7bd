//! Actor 与信箱
//!
//! 每个 Actor 拥有一个 FIFO 信箱。投递时消息追加到队尾；若当前没有排空循环在跑，则启动一个，
//! 排空循环逐条「完整」处理消息（包括其中所有 await 的外部调用）后才取下一条，队列为空时退出。
//! 排空进行中再次投递只会追加，由正在运行的循环接手；处理过程中的重入投递是安全的。
//!
//! Actor 可以在入队前拦截消息（`intercept`），例如重试命令需要插队到队首。

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use super::hub::EventEmitter;
use super::message::Message;

/// 应答去向
pub enum ReplyTo {
    /// 调用方正在等待（`MessageBus::send`）
    Caller(oneshot::Sender<Option<Message>>),
    /// 无人等待，应答广播到总线订阅者
    Broadcast(EventEmitter),
    /// 丢弃应答
    Discard,
}

impl ReplyTo {
    fn deliver(self, reply: Option<Message>) {
        match self {
            ReplyTo::Caller(tx) => {
                let _ = tx.send(reply);
            }
            ReplyTo::Broadcast(emitter) => {
                if let Some(reply) = reply {
                    emitter.emit(reply);
                }
            }
            ReplyTo::Discard => {
                if let Some(reply) = reply {
                    tracing::debug!(kind = reply.kind(), id = %reply.id, "Reply discarded");
                }
            }
        }
    }
}

/// 信箱中的一项：消息 + 应答去向
pub struct Envelope {
    pub message: Message,
    reply_to: ReplyTo,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            reply_to: ReplyTo::Discard,
        }
    }

    /// 带等待通道的投递
    pub fn with_reply(message: Message) -> (Self, oneshot::Receiver<Option<Message>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                reply_to: ReplyTo::Caller(tx),
            },
            rx,
        )
    }

    /// 应答广播到总线
    pub fn broadcast(message: Message, emitter: EventEmitter) -> Self {
        Self {
            message,
            reply_to: ReplyTo::Broadcast(emitter),
        }
    }

    /// 替换消息，保留应答去向（重试时让克隆请求的结果回到重试命令的发起方）
    pub fn with_message(self, message: Message) -> Self {
        Self {
            message,
            reply_to: self.reply_to,
        }
    }

    /// 不经处理直接应答（拦截路径使用）
    pub fn respond(self, reply: Option<Message>) {
        self.reply_to.deliver(reply);
    }
}

#[derive(Default)]
struct MailboxState {
    queue: VecDeque<Envelope>,
    draining: bool,
}

/// FIFO 信箱 + 单飞排空标记
#[derive(Default)]
pub struct Mailbox {
    state: Mutex<MailboxState>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加到队尾；返回调用方是否需要启动排空循环
    pub fn push_back(&self, envelope: Envelope) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.push_back(envelope);
        Self::claim_drain(&mut state)
    }

    /// 插入队首（排在正在处理的消息之后、其他排队消息之前）
    pub fn push_front(&self, envelope: Envelope) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.push_front(envelope);
        Self::claim_drain(&mut state)
    }

    fn claim_drain(state: &mut MailboxState) -> bool {
        if state.draining {
            false
        } else {
            state.draining = true;
            true
        }
    }

    /// 取下一条；队列为空时在同一把锁内清除排空标记，避免与投递竞争丢消息
    fn pop_next(&self) -> Option<Envelope> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = state.queue.pop_front();
        if next.is_none() {
            state.draining = false;
        }
        next
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).draining
    }

    /// 丢弃所有排队消息（等待中的调用方会收到 ReplyDropped）
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }
}

/// Actor：串行处理自身信箱中的消息
#[async_trait]
pub trait Actor: Send + Sync + 'static {
    /// 总线地址
    fn address(&self) -> &str;

    fn mailbox(&self) -> &Mailbox;

    /// 入队前拦截；返回 None 表示已自行处理（需自行 respond）
    async fn intercept(&self, envelope: Envelope) -> Option<Envelope> {
        Some(envelope)
    }

    /// 处理单条消息，返回直接应答
    async fn process(&self, message: Message) -> Option<Message>;
}

/// 投递消息给 Actor（拦截 → 入队 → 必要时启动排空）
pub async fn deliver(actor: Arc<dyn Actor>, envelope: Envelope) {
    if let Some(envelope) = actor.intercept(envelope).await {
        enqueue(actor, envelope);
    }
}

/// 追加到队尾并确保排空循环在运行
pub fn enqueue(actor: Arc<dyn Actor>, envelope: Envelope) {
    if actor.mailbox().push_back(envelope) {
        spawn_drain(actor);
    }
}

/// 插入队首并确保排空循环在运行
pub fn enqueue_front(actor: Arc<dyn Actor>, envelope: Envelope) {
    if actor.mailbox().push_front(envelope) {
        spawn_drain(actor);
    }
}

fn spawn_drain(actor: Arc<dyn Actor>) {
    tokio::spawn(drain(actor));
}

async fn drain(actor: Arc<dyn Actor>) {
    tracing::trace!(actor = actor.address(), "Mailbox drain started");
    while let Some(Envelope { message, reply_to }) = actor.mailbox().pop_next() {
        let id = message.id.clone();
        let kind = message.kind();
        match AssertUnwindSafe(actor.process(message)).catch_unwind().await {
            Ok(reply) => reply_to.deliver(reply),
            Err(_) => {
                tracing::error!(
                    actor = actor.address(),
                    %id,
                    kind,
                    "Actor panicked while processing message"
                );
            }
        }
    }
    tracing::trace!(actor = actor.address(), "Mailbox drain finished");
}
