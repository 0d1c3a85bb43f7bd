//! Bee Relay 终端入口
//!
//! 从 stdin 逐行读取输入（`!retry` 为重试命令），经中继发给 Agent，结果打印到 stdout。
//!
//! 运行方式：
//! ```bash
//! cargo run -- [config.toml]
//! RELAY__AGENT__MOCK=true cargo run
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bee_relay::config::load_config;
use bee_relay::observability;
use bee_relay::surface::ConsoleSurface;
use bee_relay::Relay;
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_CONVERSATION: &str = "console";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    observability::init(&cfg.app.log_filter);

    let agent = Relay::agent_from_config(&cfg.agent);
    let relay = Relay::new(&cfg, agent, Arc::new(ConsoleSurface::new()));

    tracing::info!(
        app = %cfg.app.name,
        "Type a message, `!retry` to repeat the last one, Ctrl+C to quit"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    wait_until_idle(&relay).await;
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = relay.submit_text(CONSOLE_CONVERSATION, &line).await {
                    tracing::warn!(error = %e, "Failed to submit input");
                }
            }
        }
    }

    relay.shutdown().await;
    Ok(())
}

/// stdin 关闭后等待进行中的请求处理完（Ctrl+C 可提前退出）
async fn wait_until_idle(relay: &Relay) {
    let idle = async {
        while !relay.is_idle() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::select! {
        _ = idle => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
