//! Worker Actor：串行调用外部 Agent
//!
//! - 内容消息：合并附件为提示词，按会话缓存，调用 Agent；空内容直接返回非致命错误
//! - `!retry`：在入队前拦截，把缓存的请求换新 ID 后插到队首，取消该会话的冷却计时器
//! - 流式路径（总线已接入且开启流式）：stream_started → 按序转发 stream_partial → stream_completed / stream_error
//! - 非流式路径：只返回最终文本或错误
//!
//! 额度耗尽时安排冷却提示，可选地在冷却结束后自动重试。
//! 手动重试与自动重试通过「重试进行中」标记互斥：克隆请求入队到开始处理之间，同一会话的其他重试会被忽略。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::attachments::build_prompt;
use super::cache::{RequestCache, StoredRequest};
use crate::agent::{AgentClient, AgentRequest, ProgressEvent};
use crate::bus::{
    deliver, enqueue_front, Actor, Attachment, Envelope, EventEmitter, Mailbox, Message,
    MessageBody, StreamDelta,
};
use crate::config::WorkerSection;
use crate::core::{ClassifiedError, CooldownScheduler, ErrorClassifier, ErrorKind};

pub const NO_CONTENT: &str = "no content";
pub const NOTHING_TO_RETRY: &str = "There is no previous request to retry in this conversation.";
pub const RETRYING: &str = "Retrying your last request…";
pub const COOLDOWN_OVER: &str =
    "The usage limit has probably reset. Send !retry to run your last request again.";
pub const COOLDOWN_OVER_AUTO: &str =
    "The usage limit has probably reset. Retrying your last request automatically.";

pub struct WorkerActor {
    options: WorkerSection,
    mailbox: Mailbox,
    agent: Arc<dyn AgentClient>,
    classifier: ErrorClassifier,
    cache: RequestCache,
    cooldowns: Arc<CooldownScheduler>,
    /// 总线广播句柄；未接入时只走非流式路径
    emitter: Option<EventEmitter>,
    /// 已有重试克隆在排队的会话
    retry_in_flight: Mutex<HashSet<String>>,
    /// 会话 → Agent 会话 ID（由 session-init 得知）
    agent_sessions: Mutex<HashMap<String, String>>,
    this: Weak<WorkerActor>,
}

impl WorkerActor {
    pub fn new(
        agent: Arc<dyn AgentClient>,
        classifier: ErrorClassifier,
        emitter: Option<EventEmitter>,
        options: WorkerSection,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            options,
            mailbox: Mailbox::new(),
            agent,
            classifier,
            cache: RequestCache::new(),
            cooldowns: CooldownScheduler::new(),
            emitter,
            retry_in_flight: Mutex::new(HashSet::new()),
            agent_sessions: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// 停止：取消所有冷却计时器并清空排队消息
    pub fn stop(&self) {
        self.cooldowns.cancel_all();
        let dropped = self.mailbox.clear();
        tracing::info!(address = %self.options.address, dropped, "Worker stopped");
    }

    pub fn cooldowns(&self) -> &Arc<CooldownScheduler> {
        &self.cooldowns
    }

    pub fn cached_request(&self, conversation: &str) -> Option<StoredRequest> {
        self.cache.get(conversation)
    }

    pub fn agent_session(&self, conversation: &str) -> Option<String> {
        self.agent_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation)
            .cloned()
    }

    fn streaming_emitter(&self) -> Option<&EventEmitter> {
        self.emitter.as_ref().filter(|_| self.options.streaming)
    }

    fn notice(&self, conversation: &str, text: &str) -> MessageBody {
        MessageBody::Notice {
            conversation: conversation.to_string(),
            text: text.to_string(),
        }
    }

    /// `!retry` 快速路径（入队前执行）
    fn handle_retry(&self, envelope: Envelope, conversation: String, automatic: bool) {
        let already_queued = !self
            .retry_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conversation.clone());
        if already_queued {
            tracing::debug!(%conversation, automatic, "Retry already queued, ignoring");
            envelope.respond(None);
            return;
        }

        let Some(stored) = self.cache.get(&conversation) else {
            self.clear_retry_flag(&conversation);
            tracing::info!(%conversation, "Retry requested without a cached request");
            let notice = envelope
                .message
                .reply(self.notice(&conversation, NOTHING_TO_RETRY));
            match &self.emitter {
                Some(emitter) => {
                    emitter.emit(notice);
                    envelope.respond(None);
                }
                None => envelope.respond(Some(notice)),
            }
            return;
        };

        let Some(this) = self.this.upgrade() else {
            self.clear_retry_flag(&conversation);
            envelope.respond(None);
            return;
        };

        if self.cooldowns.cancel(&conversation) {
            tracing::debug!(%conversation, "Pending cooldown cancelled by retry");
        }

        let clone = stored.message.with_fresh_id();
        tracing::info!(
            %conversation,
            automatic,
            origin = %stored.origin_id,
            retry_id = %clone.id,
            "Retrying cached request"
        );
        if let Some(emitter) = &self.emitter {
            emitter.emit(envelope.message.reply(self.notice(&conversation, RETRYING)));
        }
        enqueue_front(this, envelope.with_message(clone));
    }

    fn clear_retry_flag(&self, conversation: &str) {
        self.retry_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conversation);
    }

    async fn handle_content(
        &self,
        message: &Message,
        conversation: &str,
        text: &str,
        attachments: &[Attachment],
    ) -> Option<Message> {
        self.clear_retry_flag(conversation);

        let prompt = build_prompt(text, attachments, self.options.attachment_preview_chars);
        if prompt.is_empty() {
            tracing::debug!(%conversation, id = %message.id, "Empty request, agent not invoked");
            return Some(message.reply(MessageBody::Error {
                conversation: conversation.to_string(),
                message: NO_CONTENT.to_string(),
                fatal: false,
                classified: None,
            }));
        }

        let enriched = Message {
            body: MessageBody::Content {
                conversation: conversation.to_string(),
                text: prompt.clone(),
                attachments: Vec::new(),
            },
            ..message.clone()
        };
        self.cache.store(
            conversation,
            StoredRequest {
                message: enriched,
                origin_id: message.id.clone(),
            },
        );

        let request = AgentRequest {
            conversation: conversation.to_string(),
            prompt,
            resume_session: self.agent_session(conversation),
        };

        let outcome = match self.streaming_emitter() {
            Some(emitter) => self.run_streaming(message, request, emitter).await,
            None => self
                .agent
                .submit(request, None)
                .await
                .map_err(|raw| (raw, None)),
        };

        match outcome {
            Ok(text) => Some(message.reply(MessageBody::Reply {
                conversation: conversation.to_string(),
                text,
            })),
            Err((raw, classified)) => {
                let classified = match classified {
                    Some(classified) => classified,
                    None => self.on_failure(conversation, &raw).await,
                };
                Some(message.reply(MessageBody::Error {
                    conversation: conversation.to_string(),
                    message: classified.hint.clone(),
                    fatal: !classified.kind.is_recoverable(),
                    classified: Some(classified),
                }))
            }
        }
    }

    /// 流式调用：Agent 调用与进度转发并发进行，结束后再发 completed / error
    async fn run_streaming(
        &self,
        message: &Message,
        request: AgentRequest,
        emitter: &EventEmitter,
    ) -> Result<String, (String, Option<ClassifiedError>)> {
        let conversation = request.conversation.clone();
        let request_id = message.id.clone();

        emitter.emit(message.reply(MessageBody::StreamStarted {
            conversation: conversation.clone(),
            request_id: request_id.clone(),
            agent_session: request.resume_session.clone(),
        }));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let submit = self.agent.submit(request, Some(tx));
        let forward = async {
            while let Some(event) = rx.recv().await {
                self.forward_progress(message, &conversation, &request_id, event, emitter);
            }
        };
        let (result, ()) = tokio::join!(submit, forward);

        match result {
            Ok(text) => {
                emitter.emit(message.reply(MessageBody::StreamCompleted {
                    conversation,
                    request_id,
                    text: text.clone(),
                }));
                Ok(text)
            }
            Err(raw) => {
                let classified = self.on_failure(&conversation, &raw).await;
                let fatal = !classified.kind.is_recoverable();
                emitter.emit(message.reply(MessageBody::StreamError {
                    conversation,
                    request_id,
                    fatal,
                    notice: (!fatal).then(|| classified.hint.clone()),
                    error: Some(classified.clone()),
                }));
                Err((raw, Some(classified)))
            }
        }
    }

    fn forward_progress(
        &self,
        message: &Message,
        conversation: &str,
        request_id: &str,
        event: ProgressEvent,
        emitter: &EventEmitter,
    ) {
        let delta = match event {
            ProgressEvent::AssistantTextDelta { text } => StreamDelta::Text(text),
            ProgressEvent::ToolResult { output, .. } => StreamDelta::ToolOutput(output),
            ProgressEvent::SessionInit { session_id } => {
                tracing::debug!(%conversation, %session_id, "Agent session initialised");
                self.agent_sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(conversation.to_string(), session_id);
                return;
            }
            ProgressEvent::Result { .. } => return,
        };
        emitter.emit(message.reply(MessageBody::StreamPartial {
            conversation: conversation.to_string(),
            request_id: request_id.to_string(),
            delta,
        }));
    }

    /// 归类失败；额度耗尽时安排冷却
    async fn on_failure(&self, conversation: &str, raw: &str) -> ClassifiedError {
        let classified = self.classifier.classify_failure(raw).await;
        tracing::warn!(
            %conversation,
            kind = %classified.kind,
            retry_after_secs = classified.retry_after.map(|d| d.as_secs()),
            "Agent call failed"
        );
        if classified.kind == ErrorKind::UsageLimit {
            self.schedule_cooldown(conversation, classified.retry_after);
        }
        classified
    }

    /// 安排冷却提示；返回钳制后的实际延迟
    pub fn schedule_cooldown(&self, conversation: &str, retry_after: Option<Duration>) -> Duration {
        let worker = self.this.clone();
        let key = conversation.to_string();
        self.cooldowns.schedule(conversation, retry_after, move || async move {
            if let Some(worker) = worker.upgrade() {
                worker.on_cooldown_elapsed(&key).await;
            }
        })
    }

    async fn on_cooldown_elapsed(&self, conversation: &str) {
        let auto = self.options.auto_retry_after_cooldown;
        let address = self.options.address.as_str();
        if let Some(emitter) = &self.emitter {
            let text = if auto { COOLDOWN_OVER_AUTO } else { COOLDOWN_OVER };
            emitter.emit(Message::new(address, address, self.notice(conversation, text)));
        }
        if !auto {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let retry = Message::new(
            address,
            address,
            MessageBody::Retry {
                conversation: conversation.to_string(),
                automatic: true,
            },
        );
        let envelope = match &self.emitter {
            Some(emitter) => Envelope::broadcast(retry, emitter.clone()),
            None => Envelope::new(retry),
        };
        deliver(this, envelope).await;
    }
}

#[async_trait]
impl Actor for WorkerActor {
    fn address(&self) -> &str {
        &self.options.address
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    async fn intercept(&self, envelope: Envelope) -> Option<Envelope> {
        match &envelope.message.body {
            MessageBody::Retry {
                conversation,
                automatic,
            } => {
                let (conversation, automatic) = (conversation.clone(), *automatic);
                self.handle_retry(envelope, conversation, automatic);
                None
            }
            _ => Some(envelope),
        }
    }

    async fn process(&self, message: Message) -> Option<Message> {
        match &message.body {
            MessageBody::Content {
                conversation,
                text,
                attachments,
            } => {
                self.handle_content(&message, conversation, text, attachments)
                    .await
            }
            other => {
                tracing::warn!(
                    kind = other.kind(),
                    id = %message.id,
                    "Worker ignored unexpected message"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ScriptedAgentClient, ScriptedTurn};
    use crate::bus::MessageBus;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        bus: MessageBus,
        agent: Arc<ScriptedAgentClient>,
        worker: Arc<WorkerActor>,
    }

    fn fixture(turns: Vec<ScriptedTurn>, streaming: bool, auto_retry: bool) -> Fixture {
        let bus = MessageBus::new();
        let agent = Arc::new(ScriptedAgentClient::new(turns));
        let client: Arc<dyn AgentClient> = agent.clone();
        let worker = WorkerActor::new(
            client,
            ErrorClassifier::default(),
            Some(bus.emitter()),
            WorkerSection {
                streaming,
                auto_retry_after_cooldown: auto_retry,
                ..WorkerSection::default()
            },
        );
        bus.register(worker.clone());
        Fixture { bus, agent, worker }
    }

    fn content(text: &str) -> Message {
        Message::content("chat", "worker", "c", text, vec![])
    }

    fn drain_now(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn next_reply(rx: &mut UnboundedReceiver<Message>) -> String {
        loop {
            let event = rx.recv().await.unwrap();
            if let MessageBody::Reply { text, .. } = event.body {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_empty_content_never_calls_agent() {
        let f = fixture(vec![], true, false);
        let (_, mut rx) = f.bus.add_listener();
        let reply = f.bus.send(content("   ")).await.unwrap().unwrap();
        match reply.body {
            MessageBody::Error {
                message,
                fatal,
                classified,
                ..
            } => {
                assert_eq!(message, NO_CONTENT);
                assert!(!fatal);
                assert!(classified.is_none());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(f.agent.call_count(), 0);
        assert!(drain_now(&mut rx).is_empty());
        assert!(f.worker.cached_request("c").is_none());
    }

    #[tokio::test]
    async fn test_attachment_only_request_reaches_agent() {
        let f = fixture(vec![], false, false);
        let message = Message::content(
            "chat",
            "worker",
            "c",
            "",
            vec![Attachment::new("log.txt", 10).with_preview("boom")],
        );
        f.bus.send(message).await.unwrap();
        let prompt = &f.agent.requests()[0].prompt;
        assert!(prompt.starts_with("[Attachment] log.txt"));
        assert!(prompt.ends_with("boom"));
    }

    #[tokio::test]
    async fn test_retry_without_cache_emits_one_notice() {
        let f = fixture(vec![], true, false);
        let (_, mut rx) = f.bus.add_listener();
        let reply = f.bus.send(Message::retry("chat", "worker", "c")).await.unwrap();
        assert!(reply.is_none());

        let events = drain_now(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].body,
            MessageBody::Notice {
                conversation: "c".to_string(),
                text: NOTHING_TO_RETRY.to_string(),
            }
        );
        assert!(f.worker.mailbox().is_empty());
        assert_eq!(f.agent.call_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_runs_right_after_in_flight_request() {
        let f = fixture(vec![], false, false);
        let (_, mut rx) = f.bus.add_listener();
        let gate = f.agent.hold_next();
        let started = f.agent.started();

        f.bus.post(content("A")).await.unwrap();
        started.notified().await;
        f.bus.post(content("B")).await.unwrap();
        f.bus.post(content("C")).await.unwrap();
        f.bus.post(Message::retry("chat", "worker", "c")).await.unwrap();
        assert_eq!(f.worker.mailbox().len(), 3);
        gate.notify_one();

        let mut replies = Vec::new();
        for _ in 0..4 {
            replies.push(next_reply(&mut rx).await);
        }
        assert_eq!(replies, vec!["A", "A", "B", "C"]);
        let prompts: Vec<String> = f.agent.requests().into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["A", "A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_second_retry_ignored_while_first_is_queued() {
        let f = fixture(vec![], false, false);
        let (_, mut rx) = f.bus.add_listener();
        let gate = f.agent.hold_next();
        let started = f.agent.started();

        f.bus.post(content("A")).await.unwrap();
        started.notified().await;
        f.bus.post(Message::retry("chat", "worker", "c")).await.unwrap();
        f.bus.post(Message::retry("chat", "worker", "c")).await.unwrap();
        assert_eq!(f.worker.mailbox().len(), 1);
        gate.notify_one();

        next_reply(&mut rx).await;
        next_reply(&mut rx).await;
        assert_eq!(f.agent.call_count(), 2);
        assert!(f.worker.mailbox().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_ignored_while_automatic_retry_is_queued() {
        let f = fixture(vec![ScriptedTurn::fail("429 Too Many Requests")], false, true);
        let (_, mut rx) = f.bus.add_listener();
        let started = f.agent.started();
        f.bus.send(content("A")).await.unwrap();
        assert!(f.worker.cooldowns().is_pending("c"));
        // 消费 A 留下的开始通知
        started.notified().await;

        let gate = f.agent.hold_next();
        f.bus.post(content("B")).await.unwrap();
        started.notified().await;

        // 冷却在 B 处理期间结束，自动重试的克隆排到队首
        let cooldown = crate::core::cooldown::DEFAULT_COOLDOWN;
        tokio::time::sleep(cooldown + Duration::from_secs(1)).await;
        assert!(!f.worker.cooldowns().is_pending("c"));
        assert_eq!(f.worker.mailbox().len(), 1);

        f.bus.post(Message::retry("chat", "worker", "c")).await.unwrap();
        assert_eq!(f.worker.mailbox().len(), 1);
        gate.notify_one();

        assert_eq!(next_reply(&mut rx).await, "B");
        assert_eq!(next_reply(&mut rx).await, "B");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.agent.call_count(), 3);
        assert!(f.worker.mailbox().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_events_in_order() {
        let f = fixture(
            vec![ScriptedTurn::ok("Hello world").with_events(vec![
                ProgressEvent::SessionInit {
                    session_id: "s1".to_string(),
                },
                ProgressEvent::AssistantTextDelta {
                    text: "Hello".to_string(),
                },
                ProgressEvent::ToolResult {
                    tool: Some("ls".to_string()),
                    output: "a.txt".to_string(),
                },
                ProgressEvent::AssistantTextDelta {
                    text: " world".to_string(),
                },
            ])],
            true,
            false,
        );
        let (_, mut rx) = f.bus.add_listener();
        let request = content("hi");
        let reply = f.bus.send(request.clone()).await.unwrap().unwrap();
        assert!(matches!(
            reply.body,
            MessageBody::Reply { ref text, .. } if text == "Hello world"
        ));

        let events = drain_now(&mut rx);
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "stream_started",
                "stream_partial",
                "stream_partial",
                "stream_partial",
                "stream_completed"
            ]
        );
        let deltas: Vec<StreamDelta> = events
            .iter()
            .filter_map(|e| match &e.body {
                MessageBody::StreamPartial {
                    request_id, delta, ..
                } => {
                    assert_eq!(request_id, &request.id);
                    Some(delta.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            deltas,
            vec![
                StreamDelta::Text("Hello".to_string()),
                StreamDelta::ToolOutput("a.txt".to_string()),
                StreamDelta::Text(" world".to_string()),
            ]
        );
        assert_eq!(f.worker.agent_session("c").as_deref(), Some("s1"));

        f.bus.send(content("again")).await.unwrap();
        assert_eq!(f.agent.requests()[1].resume_session.as_deref(), Some("s1"));
        let started = drain_now(&mut rx).remove(0);
        assert!(matches!(
            started.body,
            MessageBody::StreamStarted { agent_session: Some(ref s), .. } if s == "s1"
        ));
    }

    #[tokio::test]
    async fn test_usage_limit_emits_error_and_schedules_cooldown() {
        let f = fixture(
            vec![ScriptedTurn::fail("5-hour limit reached, resets 3am")],
            true,
            false,
        );
        let (_, mut rx) = f.bus.add_listener();
        let reply = f.bus.send(content("hi")).await.unwrap().unwrap();
        match reply.body {
            MessageBody::Error { fatal, classified, .. } => {
                assert!(!fatal);
                assert_eq!(classified.unwrap().kind, ErrorKind::UsageLimit);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let events = drain_now(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1].body {
            MessageBody::StreamError {
                fatal,
                notice,
                error,
                ..
            } => {
                assert!(!fatal);
                assert_eq!(notice.as_deref(), Some(error.as_ref().unwrap().hint.as_str()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(f.worker.cooldowns().is_pending("c"));
        f.worker.stop();
        assert!(!f.worker.cooldowns().is_pending("c"));
    }

    #[tokio::test]
    async fn test_manual_retry_cancels_cooldown() {
        let f = fixture(vec![ScriptedTurn::fail("429 Too Many Requests")], false, false);
        f.bus.send(content("hi")).await.unwrap();
        assert!(f.worker.cooldowns().is_pending("c"));

        let reply = f
            .bus
            .send(Message::retry("chat", "worker", "c"))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reply.body, MessageBody::Reply { ref text, .. } if text == "hi"));
        assert!(!f.worker.cooldowns().is_pending("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_retry_after_cooldown() {
        let f = fixture(
            vec![ScriptedTurn::fail("429 Too Many Requests"), ScriptedTurn::ok("done")],
            false,
            true,
        );
        let (_, mut rx) = f.bus.add_listener();
        f.bus.send(content("hi")).await.unwrap();
        assert!(f.worker.cooldowns().is_pending("c"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.body,
            MessageBody::Notice { ref text, .. } if text == COOLDOWN_OVER_AUTO
        ));
        assert_eq!(next_reply(&mut rx).await, "done");
        assert_eq!(f.agent.call_count(), 2);
    }

    #[tokio::test]
    async fn test_dependency_missing_is_fatal_without_emitter() {
        let agent: Arc<dyn AgentClient> =
            Arc::new(ScriptedAgentClient::new(vec![ScriptedTurn::fail(
                "failed to spawn claude: No such file or directory (os error 2)",
            )]));
        let worker = WorkerActor::new(
            agent,
            ErrorClassifier::default(),
            None,
            WorkerSection::default(),
        );
        let (envelope, rx) = Envelope::with_reply(content("hi"));
        deliver(worker.clone(), envelope).await;
        let reply = rx.await.unwrap().unwrap();
        match reply.body {
            MessageBody::Error { fatal, classified, .. } => {
                assert!(fatal);
                assert_eq!(classified.unwrap().kind, ErrorKind::DependencyMissing);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(!worker.cooldowns().is_pending("c"));
    }
}
