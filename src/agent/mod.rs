//! 外部 Agent 客户端：trait 定义、外部进程实现、进程内实现

pub mod command;
pub mod mock;
pub mod traits;

pub use command::CommandAgentClient;
pub use mock::{EchoAgentClient, ScriptedAgentClient, ScriptedTurn};
pub use traits::{AgentClient, AgentRequest, ProgressEvent, ProgressSender};
