//! 进程内消息总线
//!
//! - `send`：点对点投递到收件 Actor，等待其处理并返回直接应答
//! - `post`：点对点投递但不等待，应答广播给订阅者
//! - `emit`：广播给所有订阅者（流式事件、提示），与点对点路径互不影响
//!
//! 订阅者是无界通道，同一订阅者看到的事件顺序与 emit 顺序一致。
//! emit 先对订阅者列表做快照再逐个发送，期间的注册 / 注销不会影响本次遍历。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use super::actor::{deliver, Actor, Envelope};
use super::message::{Address, Message};
use crate::core::RelayError;

/// 订阅者 ID
pub type ListenerId = u64;

#[derive(Default)]
struct ListenerRegistry {
    listeners: RwLock<Vec<(ListenerId, mpsc::UnboundedSender<Message>)>>,
    next_id: AtomicU64,
}

/// 订阅者注册表（可克隆的广播句柄）
#[derive(Clone, Default)]
pub struct EventEmitter {
    registry: Arc<ListenerRegistry>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册订阅者，返回 ID 与接收端
    pub fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tx));
        (id, rx)
    }

    /// 注销订阅者
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.registry.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// 广播；返回成功送达的订阅者数。接收端已关闭的订阅者会被顺带清理。
    pub fn emit(&self, message: Message) -> usize {
        let snapshot: Vec<(ListenerId, mpsc::UnboundedSender<Message>)> = self
            .registry
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in &snapshot {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }

        if !closed.is_empty() {
            self.registry
                .listeners
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| !closed.contains(id));
            tracing::debug!(count = closed.len(), "Pruned closed listeners");
        }

        tracing::trace!(kind = message.kind(), delivered, "Event emitted");
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// 消息总线：Actor 路由表 + 订阅者注册表
#[derive(Default)]
pub struct MessageBus {
    actors: RwLock<HashMap<Address, Arc<dyn Actor>>>,
    emitter: EventEmitter,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 Actor（同地址会覆盖旧的）
    pub fn register(&self, actor: Arc<dyn Actor>) {
        let address = actor.address().to_string();
        tracing::debug!(%address, "Actor registered");
        self.actors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, actor);
    }

    pub fn unregister(&self, address: &str) -> Option<Arc<dyn Actor>> {
        self.actors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address)
    }

    fn lookup(&self, address: &str) -> Result<Arc<dyn Actor>, RelayError> {
        self.actors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
            .ok_or_else(|| RelayError::UnknownRecipient(address.to_string()))
    }

    /// 点对点投递并等待直接应答
    pub async fn send(&self, message: Message) -> Result<Option<Message>, RelayError> {
        let actor = self.lookup(&message.to)?;
        let id = message.id.clone();
        let (envelope, rx) = Envelope::with_reply(message);
        deliver(actor, envelope).await;
        rx.await.map_err(|_| RelayError::ReplyDropped(id))
    }

    /// 点对点投递，不等待；应答广播给订阅者
    pub async fn post(&self, message: Message) -> Result<(), RelayError> {
        let actor = self.lookup(&message.to)?;
        deliver(actor, Envelope::broadcast(message, self.emitter.clone())).await;
        Ok(())
    }

    /// 广播事件
    pub fn emit(&self, message: Message) -> usize {
        self.emitter.emit(message)
    }

    pub fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<Message>) {
        self.emitter.add_listener()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.emitter.remove_listener(id)
    }

    /// 广播句柄（交给需要 emit 的组件，避免持有整个总线）
    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Mailbox, MessageBody};
    use async_trait::async_trait;

    struct Echo {
        mailbox: Mailbox,
    }

    #[async_trait]
    impl Actor for Echo {
        fn address(&self) -> &str {
            "echo"
        }

        fn mailbox(&self) -> &Mailbox {
            &self.mailbox
        }

        async fn process(&self, message: Message) -> Option<Message> {
            match &message.body {
                MessageBody::Content { conversation, text, .. } if !text.is_empty() => {
                    Some(message.reply(MessageBody::Reply {
                        conversation: conversation.clone(),
                        text: text.to_uppercase(),
                    }))
                }
                _ => None,
            }
        }
    }

    fn bus_with_echo() -> MessageBus {
        let bus = MessageBus::new();
        bus.register(Arc::new(Echo { mailbox: Mailbox::new() }));
        bus
    }

    #[tokio::test]
    async fn test_send_returns_reply() {
        let bus = bus_with_echo();
        let request = Message::content("chat", "echo", "c", "hi", vec![]);
        let reply = bus.send(request.clone()).await.unwrap().unwrap();
        assert_eq!(reply.in_reply_to.as_deref(), Some(request.id.as_str()));
        assert!(matches!(reply.body, MessageBody::Reply { ref text, .. } if text == "HI"));
    }

    #[tokio::test]
    async fn test_send_without_reply() {
        let bus = bus_with_echo();
        let reply = bus
            .send(Message::content("chat", "echo", "c", "", vec![]))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let bus = MessageBus::new();
        let err = bus
            .send(Message::content("chat", "nobody", "c", "hi", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownRecipient(ref a) if a == "nobody"));
    }

    #[tokio::test]
    async fn test_post_broadcasts_reply() {
        let bus = bus_with_echo();
        let (_, mut rx) = bus.add_listener();
        bus.post(Message::content("chat", "echo", "c", "yo", vec![]))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.body, MessageBody::Reply { ref text, .. } if text == "YO"));
    }

    #[test]
    fn test_emit_reaches_all_listeners_in_order() {
        let bus = MessageBus::new();
        let (_, mut a) = bus.add_listener();
        let (_, mut b) = bus.add_listener();
        for text in ["one", "two"] {
            let delivered = bus.emit(Message::new(
                "worker",
                "*",
                MessageBody::Notice {
                    conversation: "c".to_string(),
                    text: text.to_string(),
                },
            ));
            assert_eq!(delivered, 2);
        }
        for rx in [&mut a, &mut b] {
            for expected in ["one", "two"] {
                let msg = rx.try_recv().unwrap();
                assert!(matches!(
                    msg.body,
                    MessageBody::Notice { ref text, .. } if text == expected
                ));
            }
        }
    }

    #[test]
    fn test_remove_and_prune_listeners() {
        let bus = MessageBus::new();
        let (keep_id, _keep_rx) = bus.add_listener();
        let (drop_id, drop_rx) = bus.add_listener();
        let (gone_id, _gone_rx) = bus.add_listener();
        assert!(bus.remove_listener(gone_id));
        assert!(!bus.remove_listener(gone_id));
        drop(drop_rx);

        let delivered = bus.emit(Message::new(
            "worker",
            "*",
            MessageBody::Notice {
                conversation: "c".to_string(),
                text: "x".to_string(),
            },
        ));
        assert_eq!(delivered, 1);
        assert_eq!(bus.emitter().listener_count(), 1);
        assert!(bus.remove_listener(keep_id));
        assert!(!bus.remove_listener(drop_id));
    }
}
