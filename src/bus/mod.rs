//! 进程内消息总线与 Actor
//!
//! - **message**：消息与载荷定义（封闭枚举，按类型标签分发）
//! - **actor**：Actor trait、FIFO 信箱与单飞排空循环
//! - **hub**：MessageBus 路由（点对点 send / post）与订阅者广播（emit）
//!
//! 这是单进程内存路由，不是分布式消息代理；不做持久化。

mod actor;
mod hub;
mod message;

pub use actor::{deliver, enqueue, enqueue_front, Actor, Envelope, Mailbox, ReplyTo};
pub use hub::{EventEmitter, ListenerId, MessageBus};
pub use message::{Address, Attachment, ConversationId, Message, MessageBody, StreamDelta};
