//! Worker：串行调用外部 Agent，缓存最近请求，发出流式进度事件

pub mod actor;
pub mod attachments;
pub mod cache;

pub use actor::WorkerActor;
pub use attachments::build_prompt;
pub use cache::{RequestCache, StoredRequest};
