//! 流式会话协调器
//!
//! 订阅总线上的流式事件，为每个进行中的请求维护一个缓冲 / 刷新状态机，
//! 通过可重试的 send / edit / delete 渲染到聊天端。
//!
//! Started → Buffering → Completed | Errored
//! - Started：可选地发一条占位消息
//! - Buffering：追加增量，若没有待触发的刷新则在 flush_interval 后刷新一次
//! - Completed：取消刷新（进行中的投递先跑完）、最后刷新一次残余缓冲、删除占位、按行分块发送最终文本、记录 ID
//! - Errored：取消刷新（同上）、删除占位、发送中止提示或非致命提示、记录 ID
//!
//! 非流式路径的最终应答经 `deliver_reply` 投递；已完成的请求 ID 在保留期内会屏蔽重复投递。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::completed::CompletedIdSet;
use super::session::{DeliveryMode, FlushTimer, SessionState, StreamingSession};
use crate::bus::{Message, MessageBody, StreamDelta};
use crate::config::StreamingSection;
use crate::core::{with_retry, ClassifiedError, RetryOptions};
use crate::surface::{split_into_chunks, truncate_with_marker, ChatSurface, MessageHandle};

pub const ABORTED_PREFIX: &str = "Request aborted:";

/// edit / delete 的重试上限（目标消息可能已不存在）
pub const CLEANUP_MAX_RETRIES: u32 = 5;

pub struct StreamingCoordinator {
    options: StreamingSection,
    retry: RetryOptions,
    cleanup_retry: RetryOptions,
    surface: Arc<dyn ChatSurface>,
    sessions: Mutex<HashMap<String, StreamingSession>>,
    completed: CompletedIdSet,
    this: Weak<StreamingCoordinator>,
}

impl StreamingCoordinator {
    pub fn new(
        surface: Arc<dyn ChatSurface>,
        options: StreamingSection,
        retry: RetryOptions,
    ) -> Arc<Self> {
        let cleanup_retry = match retry.max_retries {
            Some(max) if max <= CLEANUP_MAX_RETRIES => retry.clone(),
            _ => retry.clone().with_max_retries(CLEANUP_MAX_RETRIES),
        };
        Arc::new_cyclic(|this| Self {
            completed: CompletedIdSet::new(options.completed_grace()),
            options,
            retry,
            cleanup_retry,
            surface,
            sessions: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// 启动事件循环：逐条处理订阅到的事件，直到取消或通道关闭
    pub fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Streaming coordinator started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(message) => self.handle_event(message).await,
                        None => break,
                    },
                }
            }
            self.stop();
            tracing::info!("Streaming coordinator stopped");
        })
    }

    /// 按类型标签分派
    pub async fn handle_event(&self, message: Message) {
        match &message.body {
            MessageBody::StreamStarted {
                conversation,
                request_id,
                ..
            } => self.on_started(conversation, request_id).await,
            MessageBody::StreamPartial {
                conversation,
                request_id,
                delta,
            } => self.on_partial(conversation, request_id, delta.clone()),
            MessageBody::StreamCompleted {
                conversation,
                request_id,
                text,
            } => self.on_completed(conversation, request_id, text).await,
            MessageBody::StreamError {
                conversation,
                request_id,
                fatal,
                error,
                notice,
            } => {
                self.on_error(conversation, request_id, *fatal, error.as_ref(), notice.as_deref())
                    .await
            }
            MessageBody::Notice { conversation, text } => {
                self.send(conversation, text).await;
            }
            MessageBody::Reply { .. } | MessageBody::Error { .. } => {
                self.deliver_reply(&message).await;
            }
            MessageBody::Content { .. } | MessageBody::Retry { .. } => {}
        }
    }

    async fn on_started(&self, conversation: &str, request_id: &str) {
        {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(request_id) {
                tracing::debug!(%request_id, "Stream started after partials, keeping session");
                return;
            }
            sessions.insert(
                request_id.to_string(),
                StreamingSession::new(request_id, conversation, self.options.mode),
            );
        }
        tracing::debug!(%conversation, %request_id, "Streaming session started");

        if !self.options.placeholder {
            return;
        }
        if let Some(handle) = self.send(conversation, &self.options.placeholder_text).await {
            self.adopt_placeholder(request_id, handle).await;
        }
    }

    fn on_partial(&self, conversation: &str, request_id: &str, delta: StreamDelta) {
        let mut sessions = self.lock_sessions();
        let session = sessions.entry(request_id.to_string()).or_insert_with(|| {
            tracing::debug!(
                %conversation,
                %request_id,
                "Partial before start, creating session implicitly"
            );
            StreamingSession::new(request_id, conversation, self.options.mode)
        });
        if session.push(delta) {
            session.flush_timer = Some(self.spawn_flush_timer(request_id));
        }
    }

    fn spawn_flush_timer(&self, request_id: &str) -> FlushTimer {
        let coordinator = self.this.clone();
        let request_id = request_id.to_string();
        FlushTimer::spawn(self.options.flush_interval(), async move {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.flush(&request_id).await;
            }
        })
    }

    /// 定时刷新：读取并清空缓冲后投递；期间又有新增量且会话未结束时再安排一次
    async fn flush(&self, request_id: &str) {
        let pending = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.get_mut(request_id) else {
                return;
            };
            session
                .take_pending()
                .map(|text| (text, session.conversation.clone(), session.placeholder.clone()))
        };

        if let Some((text, conversation, placeholder)) = pending {
            self.deliver_update(request_id, &conversation, &text, placeholder).await;
        }

        let mut sessions = self.lock_sessions();
        if let Some(session) = sessions.get_mut(request_id) {
            session.flush_timer = None;
            if session.has_pending() && !session.state.is_terminal() {
                session.flush_timer = Some(self.spawn_flush_timer(request_id));
            }
        }
    }

    /// 把会话置为终态并等待刷新任务结束，然后移出会话表
    async fn close_session(
        &self,
        request_id: &str,
        state: SessionState,
    ) -> Option<StreamingSession> {
        let timer = self
            .lock_sessions()
            .get_mut(request_id)
            .and_then(|session| session.finish(state));
        if let Some(timer) = timer {
            timer.settle().await;
        }
        self.lock_sessions().remove(request_id)
    }

    async fn deliver_update(
        &self,
        request_id: &str,
        conversation: &str,
        text: &str,
        placeholder: Option<MessageHandle>,
    ) {
        let text = truncate_with_marker(text, self.options.max_message_chars);
        match (self.options.mode, placeholder) {
            (DeliveryMode::Edit, Some(handle)) => {
                self.edit(&handle, &text).await;
            }
            (DeliveryMode::Edit, None) => {
                if let Some(handle) = self.send(conversation, &text).await {
                    self.adopt_placeholder(request_id, handle).await;
                }
            }
            (DeliveryMode::Append, _) => {
                self.send(conversation, &text).await;
            }
        }
    }

    /// 记录占位消息；会话已结束时删除这条迟到的消息
    async fn adopt_placeholder(&self, request_id: &str, handle: MessageHandle) {
        let orphan = {
            let mut sessions = self.lock_sessions();
            match sessions.get_mut(request_id) {
                Some(session) if session.placeholder.is_none() => {
                    session.placeholder = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };
        if let Some(handle) = orphan {
            self.delete(&handle).await;
        }
    }

    async fn on_completed(&self, conversation: &str, request_id: &str, text: &str) {
        let session = self.close_session(request_id, SessionState::Completed).await;

        if let Some(mut session) = session {
            if let Some(residual) = session.take_pending() {
                let residual = truncate_with_marker(&residual, self.options.max_message_chars);
                match (session.mode, &session.placeholder) {
                    (DeliveryMode::Edit, Some(handle)) => self.edit(handle, &residual).await,
                    (DeliveryMode::Append, _) => {
                        self.send(conversation, &residual).await;
                    }
                    (DeliveryMode::Edit, None) => {}
                }
            }
            if let Some(handle) = session.placeholder.take() {
                self.delete(&handle).await;
            }
        } else {
            tracing::debug!(%conversation, %request_id, "Completed without a session");
        }

        self.send_paced(conversation, text).await;
        if self.options.done_marker {
            tokio::time::sleep(self.options.chunk_delay()).await;
            self.send(conversation, &self.options.done_text).await;
        }

        self.completed.insert(request_id);
        tracing::debug!(%conversation, %request_id, "Streaming session completed");
    }

    async fn on_error(
        &self,
        conversation: &str,
        request_id: &str,
        fatal: bool,
        error: Option<&ClassifiedError>,
        notice: Option<&str>,
    ) {
        let session = self.close_session(request_id, SessionState::Errored).await;
        if let Some(mut session) = session {
            if let Some(handle) = session.placeholder.take() {
                self.delete(&handle).await;
            }
        }

        let hint = error.map(|e| e.hint.as_str());
        let text = if fatal {
            format!("{} {}", ABORTED_PREFIX, hint.unwrap_or("the agent failed."))
        } else {
            notice
                .or(hint)
                .unwrap_or("The request failed, please try again.")
                .to_string()
        };
        self.send(conversation, &text).await;

        self.completed.insert(request_id);
        tracing::debug!(%conversation, %request_id, fatal, "Streaming session errored");
    }

    /// 投递非流式路径的最终应答；对应的流式会话已完成时屏蔽。返回是否投递。
    pub async fn deliver_reply(&self, reply: &Message) -> bool {
        let origin = reply.origin_id();
        if self.completed.contains(origin) {
            tracing::debug!(
                conversation = reply.conversation(),
                %origin,
                kind = reply.kind(),
                "Duplicate final reply suppressed"
            );
            return false;
        }
        match &reply.body {
            MessageBody::Reply { conversation, text } => {
                self.send_paced(conversation, text).await;
                true
            }
            MessageBody::Error {
                conversation,
                message,
                ..
            } => {
                self.send(conversation, message).await;
                true
            }
            _ => false,
        }
    }

    /// 按行分块，块之间间隔 chunk_delay
    async fn send_paced(&self, conversation: &str, text: &str) {
        let chunks = split_into_chunks(text, self.options.max_message_chars);
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.options.chunk_delay()).await;
            }
            self.send(conversation, chunk).await;
        }
    }

    async fn send(&self, conversation: &str, text: &str) -> Option<MessageHandle> {
        let surface = &self.surface;
        match with_retry("surface.send", &self.retry, || surface.send(conversation, text)).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(%conversation, error = %e, "Failed to send message");
                None
            }
        }
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) {
        let surface = &self.surface;
        let result = with_retry("surface.edit", &self.cleanup_retry, || {
            surface.edit(handle, text)
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(
                conversation = %handle.conversation,
                error = %e,
                "Failed to edit message"
            );
        }
    }

    async fn delete(&self, handle: &MessageHandle) {
        let surface = &self.surface;
        let result = with_retry("surface.delete", &self.cleanup_retry, || {
            surface.delete(handle)
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(
                conversation = %handle.conversation,
                error = %e,
                "Failed to delete message"
            );
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamingSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 取消所有刷新任务并丢弃会话
    pub fn stop(&self) {
        let mut sessions = self.lock_sessions();
        for session in sessions.values_mut() {
            session.abort_flush();
        }
        let dropped = sessions.len();
        sessions.clear();
        if dropped > 0 {
            tracing::info!(dropped, "Dropped in-flight streaming sessions");
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn session_state(&self, request_id: &str) -> SessionState {
        self.lock_sessions()
            .get(request_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// 尚未触发的刷新任务数
    pub fn pending_flush_count(&self) -> usize {
        self.lock_sessions()
            .values()
            .filter(|s| s.flush_timer.as_ref().is_some_and(FlushTimer::is_pending))
            .count()
    }

    pub fn is_completed(&self, request_id: &str) -> bool {
        self.completed.contains(request_id)
    }
}
