//! 外部进程 Agent 客户端
//!
//! 拉起配置的可执行文件，把提示词写入 stdin，逐行读取 stdout：
//! - 能解析为 JSON ProgressEvent 的行按事件处理
//! - 其他行视为一段文本增量（保留换行）
//!
//! 退出码非零时以 stderr 作为失败描述；拉起失败返回 "failed to spawn <program>: <io error>"，
//! 便于上层归类为依赖缺失。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::traits::{AgentClient, AgentRequest, ProgressEvent, ProgressSender};

/// stderr 在错误描述中的最大保留长度
const MAX_STDERR_CHARS: usize = 4000;

/// 外部进程客户端
#[derive(Debug, Clone)]
pub struct CommandAgentClient {
    program: String,
    args: Vec<String>,
    /// 续接会话的参数名（如 `--resume`），后接会话 ID
    resume_arg: Option<String>,
    timeout: Option<Duration>,
}

impl CommandAgentClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            resume_arg: None,
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_resume_arg(mut self, resume_arg: Option<String>) -> Self {
        self.resume_arg = resume_arg;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(
        &self,
        request: AgentRequest,
        progress: Option<ProgressSender>,
    ) -> Result<String, String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let (Some(flag), Some(session)) = (&self.resume_arg, &request.resume_session) {
            cmd.arg(flag).arg(session);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.program, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| format!("failed to write prompt to {}: {}", self.program, e))?;
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| format!("stdout of {} is not available", self.program))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut collected = String::new();
        let mut result_text: Option<String> = None;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| format!("failed to read output of {}: {}", self.program, e))?
        {
            let event = parse_line(&line);
            match &event {
                ProgressEvent::AssistantTextDelta { text } => collected.push_str(text),
                ProgressEvent::Result { text } => result_text = Some(text.clone()),
                _ => {}
            }
            if let Some(tx) = &progress {
                let _ = tx.send(event);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("failed to wait for {}: {}", self.program, e))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            return Err(format!("{} exited with {}: {}", self.program, status, stderr));
        }

        Ok(result_text.unwrap_or_else(|| collected.trim_end().to_string()))
    }
}

/// 解析一行输出：JSON 事件或纯文本增量
pub fn parse_line(line: &str) -> ProgressEvent {
    let trimmed = line.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(event) = serde_json::from_str::<ProgressEvent>(trimmed) {
            return event;
        }
    }
    ProgressEvent::AssistantTextDelta {
        text: format!("{line}\n"),
    }
}

#[async_trait]
impl AgentClient for CommandAgentClient {
    async fn submit(
        &self,
        request: AgentRequest,
        progress: Option<ProgressSender>,
    ) -> Result<String, String> {
        tracing::debug!(
            program = %self.program,
            conversation = %request.conversation,
            "Spawning agent"
        );
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(request, progress))
                .await
                .map_err(|_| format!("{} timed out after {}s", self.program, limit.as_secs()))?,
            None => self.run(request, progress).await,
        }
    }

    fn program(&self) -> Option<&str> {
        Some(&self.program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn request(prompt: &str) -> AgentRequest {
        AgentRequest {
            conversation: "c".to_string(),
            prompt: prompt.to_string(),
            resume_session: None,
        }
    }

    #[test]
    fn test_parse_line_json_and_text() {
        assert_eq!(
            parse_line(r#"{"type":"session-init","session_id":"abc"}"#),
            ProgressEvent::SessionInit {
                session_id: "abc".to_string()
            }
        );
        assert_eq!(
            parse_line("{not json"),
            ProgressEvent::AssistantTextDelta {
                text: "{not json\n".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_failure() {
        let client = CommandAgentClient::new("bee-relay-definitely-missing-binary");
        let err = client.submit(request("hi"), None).await.unwrap_err();
        assert!(err.starts_with("failed to spawn bee-relay-definitely-missing-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_lines_from_process() {
        let client = CommandAgentClient::new("sh").with_args(vec![
            "-c".to_string(),
            r#"cat >/dev/null; echo '{"type":"session-init","session_id":"s1"}'; echo hello; echo world"#
                .to_string(),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let text = client.submit(request("prompt"), Some(tx)).await.unwrap();
        assert_eq!(text, "hello\nworld");

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events[0],
            ProgressEvent::SessionInit {
                session_id: "s1".to_string()
            }
        );
        assert_eq!(events.len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_uses_stderr() {
        let client = CommandAgentClient::new("sh").with_args(vec![
            "-c".to_string(),
            "cat >/dev/null; echo 'rate limit reached, resets 3am' >&2; exit 1".to_string(),
        ]);
        let err = client.submit(request("prompt"), None).await.unwrap_err();
        assert!(err.contains("rate limit reached"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resume_arg_is_passed() {
        let client = CommandAgentClient::new("sh")
            .with_args(vec!["-c".to_string(), r#"cat >/dev/null; echo "$0 $1""#.to_string()])
            .with_resume_arg(Some("--resume".to_string()));
        let mut req = request("prompt");
        req.resume_session = Some("sess-9".to_string());
        let text = client.submit(req, None).await.unwrap();
        assert_eq!(text, "--resume sess-9");
    }
}
