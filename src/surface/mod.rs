//! 聊天端：trait、终端实现、记录型实现、长文本切分

pub mod chunk;
pub mod console;
pub mod recording;
pub mod traits;

pub use chunk::{split_into_chunks, truncate_with_marker, TRUNCATION_MARKER};
pub use console::ConsoleSurface;
pub use recording::{RecordingSurface, SurfaceOp};
pub use traits::{ChatSurface, MessageHandle};
