//! 上游失败分类器
//!
//! 将 Agent 抛出的原始错误文本归类为固定分类（额度耗尽 / 载荷过大 / 网络抖动 / 依赖缺失 / 未知），
//! 并给出面向用户的提示与可选的重试等待时间。
//!
//! 规则按优先级依次匹配，首个命中即返回：
//! 1. 额度 / 速率限制（含 429）→ UsageLimit，尝试解析 "resets 3am" 之类的重置时间
//! 2. 载荷过大 → PayloadTooLarge
//! 3. 网络瞬时错误 → NetworkTransient
//! 4. 进程拉起失败 / 找不到可执行文件 → DependencyMissing（惰性执行一次版本探测）
//! 5. 其他 → Unknown

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OnceCell;

/// 诊断元数据中原始错误文本的最大保留长度
const MAX_RAW_CHARS: usize = 2000;

/// 版本探测超时
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 额度耗尽，等待重置后可恢复
    UsageLimit,
    /// 输入过大，需要调用方缩小输入
    PayloadTooLarge,
    /// 网络抖动，可立即重试
    NetworkTransient,
    /// 外部可执行文件缺失或配置错误，需要运维介入
    DependencyMissing,
    /// 无法归类
    Unknown,
}

impl ErrorKind {
    /// 用户重试即可恢复的分类
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::UsageLimit | ErrorKind::NetworkTransient)
    }

    fn base_hint(self) -> &'static str {
        match self {
            ErrorKind::UsageLimit => "The agent has reached its usage limit.",
            ErrorKind::PayloadTooLarge => {
                "The request is too large for the agent (for example an oversized image). \
                 Shrink or remove the attachment and send it again."
            }
            ErrorKind::NetworkTransient => {
                "A temporary network problem interrupted the agent."
            }
            ErrorKind::DependencyMissing => {
                "The agent executable could not be started. \
                 An operator needs to check the installation."
            }
            ErrorKind::Unknown => "The agent failed unexpectedly. Details have been logged.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::UsageLimit => write!(f, "usage_limit"),
            ErrorKind::PayloadTooLarge => write!(f, "payload_too_large"),
            ErrorKind::NetworkTransient => write!(f, "network_transient"),
            ErrorKind::DependencyMissing => write!(f, "dependency_missing"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// 归类后的错误：分类、用户提示、可选等待时间、诊断元数据（不展示给用户）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub hint: String,
    pub retry_after: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
}

fn usage_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(usage limit|rate limit|rate_limit|quota|limit reached|too many requests|\b429\b|credit balance|hour limit)",
        )
        .unwrap()
    })
}

fn reset_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bresets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").unwrap()
    })
}

fn payload_too_large_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(payload too large|request too large|entity too large|\b413\b|image exceeds|exceeds \d+\s*(mb|kb|bytes)|too large|maximum (allowed )?size)",
        )
        .unwrap()
    })
}

fn network_transient_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(ECONNRESET|ETIMEDOUT|ECONNREFUSED|EAI_AGAIN|ENOTFOUND|EPIPE|socket hang up|network error|connection (reset|refused|closed)|timed out|\b50[234]\b|service unavailable|bad gateway|overloaded)",
        )
        .unwrap()
    })
}

fn dependency_missing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(ENOENT|failed to spawn|command not found|no such file or directory|executable not found|not found in PATH)",
        )
        .unwrap()
    })
}

/// 按当前本地时间归类
pub fn classify(raw: &str) -> ClassifiedError {
    classify_at(raw, Local::now())
}

/// 以给定时间为「现在」归类（重置时间按 now 所在时区的挂钟时间计算）
pub fn classify_at<Tz: TimeZone>(raw: &str, now: DateTime<Tz>) -> ClassifiedError {
    let (kind, rule) = if usage_limit_re().is_match(raw) {
        (ErrorKind::UsageLimit, "usage_limit")
    } else if payload_too_large_re().is_match(raw) {
        (ErrorKind::PayloadTooLarge, "payload_too_large")
    } else if network_transient_re().is_match(raw) {
        (ErrorKind::NetworkTransient, "network_transient")
    } else if dependency_missing_re().is_match(raw) {
        (ErrorKind::DependencyMissing, "dependency_missing")
    } else {
        (ErrorKind::Unknown, "fallback")
    };

    let retry_after = match kind {
        ErrorKind::UsageLimit => parse_reset_delay(raw, &now),
        _ => None,
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("rule".to_string(), rule.to_string());
    metadata.insert("raw".to_string(), raw.chars().take(MAX_RAW_CHARS).collect());
    if let Some(delay) = retry_after {
        metadata.insert("retry_after_secs".to_string(), delay.as_secs().to_string());
    }

    ClassifiedError {
        kind,
        hint: build_hint(kind, retry_after),
        retry_after,
        metadata,
    }
}

fn build_hint(kind: ErrorKind, retry_after: Option<Duration>) -> String {
    let mut hint = kind.base_hint().to_string();
    if kind == ErrorKind::UsageLimit {
        if let Some(delay) = retry_after {
            let minutes = delay.as_secs().div_ceil(60);
            hint.push_str(&format!(" Estimated wait: about {minutes} minutes."));
        }
    }
    if kind.is_recoverable() {
        hint.push_str(" You can send !retry to try the last request again.");
    }
    hint
}

/// 解析 "resets 3am" / "resets at 11:30pm" / "reset at 15:00"，返回距离下一次该挂钟时间的时长
fn parse_reset_delay<Tz: TimeZone>(raw: &str, now: &DateTime<Tz>) -> Option<Duration> {
    let caps = reset_time_re().captures(raw)?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    if let Some(meridiem) = caps.get(3) {
        if hour == 0 || hour > 12 {
            return None;
        }
        let pm = meridiem.as_str().eq_ignore_ascii_case("pm");
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }
    if hour > 23 || minute > 59 {
        return None;
    }
    next_occurrence(now, hour, minute)
}

fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32, minute: u32) -> Option<Duration> {
    let tz = now.timezone();
    let today = now.date_naive();
    let mut target = tz
        .from_local_datetime(&today.and_hms_opt(hour, minute, 0)?)
        .earliest()?;
    if target <= *now {
        let tomorrow = today.succ_opt()?;
        target = tz
            .from_local_datetime(&tomorrow.and_hms_opt(hour, minute, 0)?)
            .earliest()?;
    }
    (target - now.clone()).to_std().ok()
}

/// 版本探测目标（外部可执行文件 + 版本参数）
#[derive(Debug, Clone)]
pub struct PreflightProbe {
    pub program: String,
    pub version_arg: String,
}

/// 带惰性预检的分类器：每个适配器实例持有一个，DependencyMissing 时最多执行一次版本探测
#[derive(Debug)]
pub struct ErrorClassifier {
    probe: Option<PreflightProbe>,
    preflight: OnceCell<String>,
    preflight_runs: AtomicUsize,
}

impl ErrorClassifier {
    pub fn new(probe: Option<PreflightProbe>) -> Self {
        Self {
            probe,
            preflight: OnceCell::new(),
            preflight_runs: AtomicUsize::new(0),
        }
    }

    /// 归类失败；依赖缺失时附带预检结果到诊断元数据
    pub async fn classify_failure(&self, raw: &str) -> ClassifiedError {
        let mut classified = classify(raw);
        if classified.kind == ErrorKind::DependencyMissing {
            if let Some(report) = self.preflight().await {
                classified.metadata.insert("preflight".to_string(), report);
            }
        }
        classified
    }

    /// 预检执行次数（用于确认只执行一次）
    pub fn preflight_runs(&self) -> usize {
        self.preflight_runs.load(Ordering::Relaxed)
    }

    async fn preflight(&self) -> Option<String> {
        let probe = self.probe.as_ref()?;
        let report = self
            .preflight
            .get_or_init(|| async {
                self.preflight_runs.fetch_add(1, Ordering::Relaxed);
                let report = run_probe(probe).await;
                tracing::warn!(program = %probe.program, %report, "Agent preflight finished");
                report
            })
            .await;
        Some(report.clone())
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(None)
    }
}

async fn run_probe(probe: &PreflightProbe) -> String {
    let output = Command::new(&probe.program)
        .arg(&probe.version_arg)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(PREFLIGHT_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let version = stdout.lines().next().unwrap_or("").trim();
            format!("{} is available ({})", probe.program, version)
        }
        Ok(Ok(out)) => format!(
            "{} {} exited with {}: {}",
            probe.program,
            probe.version_arg,
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Ok(Err(e)) => format!("failed to run {}: {}", probe.program, e),
        Err(_) => format!("{} {} timed out", probe.program, probe.version_arg),
    }
}
