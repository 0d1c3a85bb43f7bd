//! 核心基础设施：错误类型、失败分类、退避重试、额度冷却

pub mod classifier;
pub mod cooldown;
pub mod error;
pub mod retry;

pub use classifier::{
    classify, classify_at, ClassifiedError, ErrorClassifier, ErrorKind, PreflightProbe,
};
pub use cooldown::{clamp_cooldown, CooldownScheduler};
pub use error::RelayError;
pub use retry::{with_retry, RetryOptions};
