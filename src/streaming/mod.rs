//! 流式会话：状态机、协调器、已完成 ID 集合

pub mod completed;
pub mod coordinator;
pub mod session;

pub use completed::CompletedIdSet;
pub use coordinator::StreamingCoordinator;
pub use session::{DeliveryMode, FlushTimer, SessionState, StreamingSession};
