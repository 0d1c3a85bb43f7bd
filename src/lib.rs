//! Bee Relay - 聊天端与外部 Agent 进程之间的中继
//!
//! 模块划分：
//! - **agent**: 外部 Agent 客户端（外部进程 / 回显 / 脚本）
//! - **bus**: 进程内消息总线、Actor 与信箱
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、失败分类、退避重试、额度冷却
//! - **observability**: tracing 初始化
//! - **relay**: 装配层
//! - **streaming**: 流式会话状态机与协调器
//! - **surface**: 聊天端抽象（send / edit / delete）与长文本切分
//! - **worker**: 串行调用 Agent 的 Worker Actor

pub mod agent;
pub mod bus;
pub mod config;
pub mod core;
pub mod observability;
pub mod relay;
pub mod streaming;
pub mod surface;
pub mod worker;

pub use relay::Relay;
