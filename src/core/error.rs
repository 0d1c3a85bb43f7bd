//! 中继错误类型
//!
//! 进程级错误（路由失败、配置加载失败）使用 RelayError；
//! 上游 Agent 的失败不走这里，而是由 ErrorClassifier 归类为 ClassifiedError。

use thiserror::Error;

/// 消息总线与装配层可能出现的错误
#[derive(Error, Debug)]
pub enum RelayError {
    /// 收件地址没有注册任何 Actor
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// Actor 在回复前丢弃了应答通道（通常是任务被中止）
    #[error("Reply dropped by actor: {0}")]
    ReplyDropped(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}
