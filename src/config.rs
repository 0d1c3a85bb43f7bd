//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__WORKER__STREAMING=false`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{RelayError, RetryOptions};
use crate::streaming::DeliveryMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub worker: WorkerSection,
    pub streaming: StreamingSection,
    pub retry: RetrySection,
}

/// [app] 段：应用名与日志过滤
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 未设置 RUST_LOG 时使用的过滤表达式
    pub log_filter: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "bee-relay".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

/// [agent] 段：外部 Agent 可执行文件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub command: String,
    pub args: Vec<String>,
    /// 依赖缺失时预检使用的版本参数
    pub version_arg: String,
    /// 续接会话的参数名；为空则不续接
    pub resume_arg: Option<String>,
    /// 为 true 时使用进程内回显客户端，不拉起外部进程
    pub mock: bool,
    /// 单次调用超时（秒）；0 表示不限
    pub timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            version_arg: "--version".to_string(),
            resume_arg: None,
            mock: false,
            timeout_secs: 0,
        }
    }
}

impl AgentSection {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// [worker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// 总线地址
    pub address: String,
    /// 总线已接入时是否走流式路径
    pub streaming: bool,
    /// 附件文本预览的字符预算
    pub attachment_preview_chars: usize,
    /// 冷却结束后是否自动重试上一次请求
    pub auto_retry_after_cooldown: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            address: "worker".to_string(),
            streaming: true,
            attachment_preview_chars: 2000,
            auto_retry_after_cooldown: false,
        }
    }
}

/// [streaming] 段：缓冲刷新与最终投递
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    pub flush_interval_ms: u64,
    pub mode: DeliveryMode,
    /// 开始时是否先发一条「处理中」占位消息
    pub placeholder: bool,
    pub placeholder_text: String,
    /// 单条消息字符上限
    pub max_message_chars: usize,
    /// 最终分块之间的间隔
    pub chunk_delay_ms: u64,
    pub done_marker: bool,
    pub done_text: String,
    /// 已完成请求 ID 的保留时长
    pub completed_grace_secs: u64,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            mode: DeliveryMode::Edit,
            placeholder: true,
            placeholder_text: "Working on it…".to_string(),
            max_message_chars: 1900,
            chunk_delay_ms: 300,
            done_marker: false,
            done_text: "Done.".to_string(),
            completed_grace_secs: 60,
        }
    }
}

impl StreamingSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn completed_grace(&self) -> Duration {
        Duration::from_secs(self.completed_grace_secs)
    }
}

/// [retry] 段：聊天端调用的退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// 未设置表示无限重试
    pub max_retries: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let options = RetryOptions::default();
        Self {
            max_retries: options.max_retries,
            initial_delay_ms: options.initial_delay.as_millis() as u64,
            max_delay_ms: options.max_delay.as_millis() as u64,
            factor: options.factor,
            jitter_ms: options.jitter.as_millis() as u64,
        }
    }
}

impl From<&RetrySection> for RetryOptions {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            factor: section.factor,
            jitter: Duration::from_millis(section.jitter_ms),
        }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, RelayError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, skipped");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}
