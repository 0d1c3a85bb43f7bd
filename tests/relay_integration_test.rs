//! 中继端到端测试：脚本 Agent + 记录型聊天端，走完整的总线 / Worker / 协调器链路

use std::sync::Arc;
use std::time::Duration;

use bee_relay::agent::{AgentClient, ProgressEvent, ScriptedAgentClient, ScriptedTurn};
use bee_relay::bus::Attachment;
use bee_relay::config::AppConfig;
use bee_relay::core::RelayError;
use bee_relay::surface::{RecordingSurface, SurfaceOp};
use bee_relay::worker::actor::{NOTHING_TO_RETRY, NO_CONTENT, RETRYING};
use bee_relay::Relay;

fn test_config(streaming: bool) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.worker.streaming = streaming;
    cfg.streaming.placeholder_text = "…".to_string();
    cfg.streaming.flush_interval_ms = 500;
    cfg.retry.max_retries = Some(3);
    cfg.retry.jitter_ms = 0;
    cfg
}

fn relay_with(
    turns: Vec<ScriptedTurn>,
    cfg: &AppConfig,
) -> (Relay, Arc<ScriptedAgentClient>, Arc<RecordingSurface>) {
    let agent = Arc::new(ScriptedAgentClient::new(turns));
    let client: Arc<dyn AgentClient> = agent.clone();
    let surface = Arc::new(RecordingSurface::new());
    let relay = Relay::new(cfg, client, surface.clone());
    (relay, agent, surface)
}

/// 在暂停时钟下轮询，直到条件成立
async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_streaming_request_end_to_end() {
    let cfg = test_config(true);
    let (relay, agent, surface) = relay_with(
        vec![ScriptedTurn::ok("Hello world").with_events(vec![
            ProgressEvent::AssistantTextDelta {
                text: "Hello".to_string(),
            },
            ProgressEvent::AssistantTextDelta {
                text: " world".to_string(),
            },
        ])],
        &cfg,
    );

    relay.submit_text("c", "hi").await.unwrap();
    wait_for(|| {
        relay.is_idle() && surface.sent_texts().contains(&"Hello world".to_string())
    })
    .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let sent = surface.sent_texts();
    assert_eq!(sent[0], "…");
    // 流式完成后，非流式路径的同一应答被屏蔽
    assert_eq!(sent.iter().filter(|t| t.as_str() == "Hello world").count(), 1);
    assert!(surface.ops().contains(&SurfaceOp::Delete {
        id: "1".to_string(),
    }));
    assert_eq!(agent.call_count(), 1);
    assert_eq!(relay.coordinator().pending_flush_count(), 0);

    relay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_usage_limit_then_manual_retry() {
    let cfg = test_config(true);
    let (relay, agent, surface) = relay_with(
        vec![
            ScriptedTurn::fail("Claude AI usage limit reached|resets 3am"),
            ScriptedTurn::ok("second time lucky"),
        ],
        &cfg,
    );

    relay.submit_text("c", "do the thing").await.unwrap();
    wait_for(|| surface.sent_texts().iter().any(|t| t.contains("usage limit"))).await;
    assert!(relay.worker().cooldowns().is_pending("c"));

    relay.submit_text("c", "  !RETRY ").await.unwrap();
    wait_for(|| surface.sent_texts().contains(&"second time lucky".to_string())).await;

    assert!(!relay.worker().cooldowns().is_pending("c"));
    let sent = surface.sent_texts();
    assert_eq!(sent.iter().filter(|t| t.contains("usage limit")).count(), 1);
    assert!(sent.contains(&RETRYING.to_string()));
    let prompts: Vec<String> = agent.requests().into_iter().map(|r| r.prompt).collect();
    assert_eq!(prompts, vec!["do the thing", "do the thing"]);

    relay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_without_history_posts_one_notice() {
    let cfg = test_config(true);
    let (relay, agent, surface) = relay_with(vec![], &cfg);

    relay.submit_text("c", "!retry").await.unwrap();
    wait_for(|| !surface.sent_texts().is_empty()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(surface.sent_texts(), vec![NOTHING_TO_RETRY]);
    assert_eq!(agent.call_count(), 0);

    relay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_content_is_rejected_without_agent_call() {
    let cfg = test_config(true);
    let (relay, agent, surface) = relay_with(vec![], &cfg);

    relay.submit_text("c", "   ").await.unwrap();
    wait_for(|| !surface.sent_texts().is_empty()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(surface.sent_texts(), vec![NO_CONTENT]);
    assert_eq!(agent.call_count(), 0);

    relay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_streaming_reply_with_attachment() {
    let cfg = test_config(false);
    let (relay, agent, surface) = relay_with(vec![ScriptedTurn::ok("summarised")], &cfg);

    relay
        .submit_with_attachments(
            "c",
            "summarise this",
            vec![Attachment::new("notes.md", 42)
                .with_content_type("text/markdown")
                .with_preview("# Notes")],
        )
        .await
        .unwrap();
    wait_for(|| !surface.sent_texts().is_empty()).await;

    assert_eq!(surface.sent_texts(), vec!["summarised"]);
    let prompt = &agent.requests()[0].prompt;
    assert!(prompt.contains("[Attachment] notes.md (42 B, text/markdown)"));
    assert!(prompt.contains("# Notes"));

    relay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_unregisters_worker() {
    let cfg = test_config(true);
    let (relay, _, _) = relay_with(vec![], &cfg);
    let bus = relay.bus().clone();
    let address = relay.worker_address().to_string();

    relay.shutdown().await;

    let err = bus
        .post(bee_relay::bus::Message::content("chat", address, "c", "hi", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UnknownRecipient(_)));
}
