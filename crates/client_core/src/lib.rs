//! Real-time synchronization core for a closed-group 1:1 chat client.
//!
//! [`ConversationSyncEngine`] is the single source of truth for one
//! conversation's message list, typing flag, and loading/error state, kept
//! consistent across REST fetches, optimistic local edits, and asynchronous
//! remote events. The identity provider, REST backend, pub/sub broker, and
//! presentation layer are all collaborators behind narrow seams.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{MessageId, UserId},
    protocol::{
        ChatMessage, NewMessageEvent, SendMessageRequest, TypingAction, TypingEvent, TypingSignal,
        NEW_MESSAGE_EVENT, TYPING_START_EVENT, TYPING_STOP_EVENT,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod transport;
pub mod typing;

use auth::TokenProvider;
use config::ClientConfig;
use error::{rejected, ChatError};
use transport::{EventBinding, EventHandler, RealtimeSession};
use typing::{TypingEmit, TypingTracker};

/// Change notifications for the presentation layer. Consumers pull the new
/// state with [`ConversationSyncEngine::snapshot`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessagesChanged,
    LoadingChanged(bool),
    ErrorChanged(Option<String>),
    TypingChanged(bool),
    /// Terminal channel-authorization failure; the user must re-authenticate.
    AccessDenied(String),
}

/// Everything the presentation layer renders for the active conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    pub partner_id: Option<UserId>,
    /// Ordered ascending by `created_at`.
    pub messages: Vec<ChatMessage>,
    pub loading: bool,
    pub error: Option<String>,
    pub partner_typing: bool,
}

#[derive(Debug, Clone)]
pub struct ClearProgress {
    pub deleted: usize,
    pub total: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct ClearChatFailure {
    pub message_id: MessageId,
    pub error: String,
}

#[derive(Debug)]
pub struct ClearChatSummary {
    pub success: bool,
    pub deleted: usize,
    pub errors: Vec<ClearChatFailure>,
}

struct EngineState {
    partner: Option<UserId>,
    messages: Vec<ChatMessage>,
    loading: bool,
    error: Option<String>,
    partner_typing: bool,
    /// Bumped whenever the list's ownership changes (partner switch,
    /// confirmed deletion); an in-flight fetch holding an older epoch must
    /// not apply its result.
    fetch_epoch: u64,
    bindings: Vec<EventBinding>,
    tracker: TypingTracker,
}

pub struct ConversationSyncEngine {
    http: reqwest::Client,
    config: ClientConfig,
    tokens: Arc<dyn TokenProvider>,
    realtime: Option<Arc<RealtimeSession>>,
    inner: Mutex<EngineState>,
    changes: broadcast::Sender<EngineEvent>,
}

impl ConversationSyncEngine {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenProvider>) -> Arc<Self> {
        Self::build(config, tokens, None)
    }

    pub fn new_with_realtime(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
        realtime: Arc<RealtimeSession>,
    ) -> Arc<Self> {
        Self::build(config, tokens, Some(realtime))
    }

    fn build(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
        realtime: Option<Arc<RealtimeSession>>,
    ) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        Arc::new(Self {
            http: reqwest::Client::new(),
            config,
            tokens,
            realtime,
            inner: Mutex::new(EngineState {
                partner: None,
                messages: Vec::new(),
                loading: false,
                error: None,
                partner_typing: false,
                fetch_epoch: 0,
                bindings: Vec::new(),
                tracker: TypingTracker::new(),
            }),
            changes,
        })
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<EngineEvent> {
        self.changes.subscribe()
    }

    pub async fn snapshot(&self) -> ConversationSnapshot {
        let guard = self.inner.lock().await;
        ConversationSnapshot {
            partner_id: guard.partner.clone(),
            messages: guard.messages.clone(),
            loading: guard.loading,
            error: guard.error.clone(),
            partner_typing: guard.partner_typing,
        }
    }

    fn notify(&self, event: EngineEvent) {
        let _ = self.changes.send(event);
    }

    /// Switches the active conversation. The private-channel subscription is
    /// untouched (it is keyed to the local user); only message routing
    /// changes. Any in-flight fetch for the previous partner is logically
    /// cancelled and a fresh history fetch starts in the background.
    pub async fn select_conversation(self: &Arc<Self>, partner: Option<UserId>) {
        let stop_target = {
            let mut guard = self.inner.lock().await;
            let previous = guard.partner.clone();
            guard.fetch_epoch += 1;
            guard.partner = partner.clone();
            guard.messages.clear();
            guard.partner_typing = false;
            guard.error = None;
            guard.loading = false;
            let pending_stop = guard.tracker.submitted();
            previous.filter(|_| pending_stop.is_some())
        };
        self.notify(EngineEvent::MessagesChanged);
        self.notify(EngineEvent::TypingChanged(false));

        // The sender is responsible for ending its own typing burst; do it
        // before the old partner goes out of scope.
        if let Some(previous) = stop_target {
            self.post_typing(TypingAction::Stop, &previous).await;
        }

        if partner.is_some() {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.fetch_history().await;
            });
        }
    }

    /// Replaces the list with the server's history for the active partner,
    /// sorted ascending by `created_at`. Silent no-op without a partner or a
    /// session. Shows the loading indicator only when the list is empty, so
    /// a background refresh never flashes over existing messages. A failure
    /// records the error and keeps the last-known list.
    pub async fn fetch_history(&self) {
        let (partner, epoch, show_loading) = {
            let mut guard = self.inner.lock().await;
            let Some(partner) = guard.partner.clone() else {
                return;
            };
            if !self.tokens.is_authenticated() {
                return;
            }
            let show_loading = guard.messages.is_empty();
            if show_loading {
                guard.loading = true;
            }
            (partner, guard.fetch_epoch, show_loading)
        };
        if show_loading {
            self.notify(EngineEvent::LoadingChanged(true));
        }

        let result = self.request_history(&partner).await;

        let outcome = {
            let mut guard = self.inner.lock().await;
            if guard.fetch_epoch != epoch || guard.partner.as_ref() != Some(&partner) {
                debug!(partner = %partner, "sync: discarding stale history response");
                None
            } else {
                guard.loading = false;
                match result {
                    Ok(mut messages) => {
                        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                        guard.messages = messages;
                        guard.error = None;
                        Some(None)
                    }
                    Err(err) => {
                        let rendered = err.to_string();
                        warn!(partner = %partner, "sync: history fetch failed: {rendered}");
                        guard.error = Some(rendered.clone());
                        Some(Some(rendered))
                    }
                }
            }
        };

        match outcome {
            Some(None) => {
                if show_loading {
                    self.notify(EngineEvent::LoadingChanged(false));
                }
                self.notify(EngineEvent::MessagesChanged);
                self.notify(EngineEvent::ErrorChanged(None));
            }
            Some(Some(rendered)) => {
                if show_loading {
                    self.notify(EngineEvent::LoadingChanged(false));
                }
                self.notify(EngineEvent::ErrorChanged(Some(rendered)));
            }
            None => {}
        }
    }

    async fn request_history(&self, partner: &UserId) -> Result<Vec<ChatMessage>, ChatError> {
        let token = self.tokens.bearer_token(&self.config.auth_audience).await?;
        let response = self
            .http
            .get(self.config.endpoint("/chat_messages"))
            .query(&[("participantId", partner.as_str())])
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }

    /// Optimistic send: the message appears in the list before any network
    /// round-trip. On failure exactly that entry is rolled back and the
    /// error is returned; on success the optimistic entry stays until the
    /// next history refetch reconciles it with the server record.
    pub async fn send_message(
        &self,
        receiver: &UserId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let sender = self.tokens.subject_id().ok_or(ChatError::NotAuthenticated)?;

        let optimistic = ChatMessage {
            id: MessageId::local(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            content: content.to_string(),
            message_type: "text".to_string(),
            created_at: Utc::now(),
            read_status: false,
        };
        {
            let mut guard = self.inner.lock().await;
            guard.messages.push(optimistic.clone());
        }
        self.notify(EngineEvent::MessagesChanged);

        match self.post_message(&sender, receiver, content).await {
            Ok(created) => Ok(created),
            Err(err) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.messages.retain(|message| message.id != optimistic.id);
                }
                self.notify(EngineEvent::MessagesChanged);
                warn!(receiver = %receiver, "sync: send failed, optimistic entry rolled back: {err}");
                Err(err)
            }
        }
    }

    async fn post_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let token = self.tokens.bearer_token(&self.config.auth_audience).await?;
        let response = self
            .http
            .post(self.config.endpoint("/chat_messages"))
            .bearer_auth(token)
            .json(&SendMessageRequest {
                sender_id: sender.clone(),
                receiver_id: receiver.clone(),
                content: content.to_string(),
                message_type: "text".to_string(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }

    /// Confirm-then-apply: the message leaves local state only after the
    /// backend acknowledged the delete.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), ChatError> {
        if !self.tokens.is_authenticated() {
            return Err(ChatError::NotAuthenticated);
        }
        let token = self.tokens.bearer_token(&self.config.auth_audience).await?;
        let response = self
            .http
            .delete(
                self.config
                    .endpoint(&format!("/chat_messages/{}", message_id.as_str())),
            )
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        {
            let mut guard = self.inner.lock().await;
            guard.messages.retain(|message| message.id != *message_id);
            // Confirmed deletions outrank any refetch already in flight.
            guard.fetch_epoch += 1;
        }
        self.notify(EngineEvent::MessagesChanged);
        Ok(())
    }

    pub async fn clear_chat(&self) -> Result<ClearChatSummary, ChatError> {
        self.clear_chat_with_progress(|_| {}).await
    }

    /// Deletes every message in the current list, one call at a time; the
    /// strictly sequential awaits plus the fixed delay are the throttling.
    /// Individual failures are accumulated, never abort the batch.
    pub async fn clear_chat_with_progress(
        &self,
        mut on_progress: impl FnMut(ClearProgress),
    ) -> Result<ClearChatSummary, ChatError> {
        if !self.tokens.is_authenticated() {
            return Err(ChatError::NotAuthenticated);
        }
        let ids: Vec<MessageId> = {
            let guard = self.inner.lock().await;
            guard.messages.iter().map(|message| message.id.clone()).collect()
        };
        let total = ids.len();
        let mut deleted = 0usize;
        let mut errors: Vec<ClearChatFailure> = Vec::new();

        for (index, message_id) in ids.iter().enumerate() {
            match self.delete_message(message_id).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    warn!(message_id = %message_id, "sync: clear skipped one message: {err}");
                    errors.push(ClearChatFailure {
                        message_id: message_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
            on_progress(ClearProgress {
                deleted,
                total,
                errors: errors.len(),
            });
            if index + 1 < total {
                tokio::time::sleep(self.config.clear_chat_delay).await;
            }
        }

        Ok(ClearChatSummary {
            success: errors.is_empty(),
            deleted,
            errors,
        })
    }

    /// Fire-and-forget typing notification to the current partner. Failures
    /// are logged, never surfaced, never retried.
    pub async fn send_typing_start(&self) {
        let Some(partner) = self.inner.lock().await.partner.clone() else {
            return;
        };
        self.post_typing(TypingAction::Start, &partner).await;
    }

    pub async fn send_typing_stop(&self) {
        let Some(partner) = self.inner.lock().await.partner.clone() else {
            return;
        };
        self.post_typing(TypingAction::Stop, &partner).await;
    }

    async fn post_typing(&self, action: TypingAction, target: &UserId) {
        let result: Result<(), ChatError> = async {
            let token = self.tokens.bearer_token(&self.config.auth_audience).await?;
            let response = self
                .http
                .post(self.config.endpoint("/pusher/typing"))
                .bearer_auth(token)
                .json(&TypingSignal {
                    action,
                    target_user_id: target.clone(),
                })
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(rejected(response).await);
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            warn!(target = %target, "typing: signal delivery failed: {err}");
        }
    }

    /// Keystroke entry point: emits start exactly once per burst and keeps
    /// rearming the inactivity deadline.
    pub async fn notify_input_changed(self: &Arc<Self>, content: &str) {
        let emit = {
            let mut guard = self.inner.lock().await;
            guard.tracker.input_changed(content)
        };
        match emit {
            Some(TypingEmit::Start { generation }) => {
                self.send_typing_start().await;
                self.arm_typing_deadline(generation);
            }
            Some(TypingEmit::Rearm { generation }) => self.arm_typing_deadline(generation),
            Some(TypingEmit::Stop) => self.send_typing_stop().await,
            None => {}
        }
    }

    pub async fn notify_message_submitted(&self) {
        let action = {
            let mut guard = self.inner.lock().await;
            guard.tracker.submitted()
        };
        if action.is_some() {
            self.send_typing_stop().await;
        }
    }

    fn arm_typing_deadline(self: &Arc<Self>, generation: u64) {
        let engine = Arc::clone(self);
        let debounce = self.config.typing_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let action = {
                let mut guard = engine.inner.lock().await;
                guard.tracker.deadline_elapsed(generation)
            };
            if action.is_some() {
                engine.send_typing_stop().await;
            }
        });
    }

    /// Binds the remote-event handlers and brings the per-user subscription
    /// up. Idempotent through the session's state machine; an access-denied
    /// outcome is terminal and reported to the presentation layer.
    pub async fn start_realtime(self: &Arc<Self>) -> Result<(), ChatError> {
        let realtime = self
            .realtime
            .clone()
            .ok_or_else(|| ChatError::Transport("no realtime session configured".into()))?;
        let user = self.tokens.subject_id().ok_or(ChatError::NotAuthenticated)?;

        let weak = Arc::downgrade(self);
        let new_message: EventHandler = Arc::new({
            let weak = weak.clone();
            move |payload| {
                let Some(engine) = weak.upgrade() else { return };
                match serde_json::from_value::<NewMessageEvent>(payload) {
                    Ok(event) => {
                        tokio::spawn(async move {
                            engine.handle_new_message(event.message).await;
                        });
                    }
                    Err(err) => warn!("sync: invalid new-message payload: {err}"),
                }
            }
        });
        let typing_start: EventHandler = Arc::new({
            let weak = weak.clone();
            move |payload| {
                let Some(engine) = weak.upgrade() else { return };
                match serde_json::from_value::<TypingEvent>(payload) {
                    Ok(event) => {
                        tokio::spawn(async move {
                            engine.handle_remote_typing(event.sender_id, true).await;
                        });
                    }
                    Err(err) => warn!("sync: invalid typing-start payload: {err}"),
                }
            }
        });
        let typing_stop: EventHandler = Arc::new({
            let weak = weak.clone();
            move |payload| {
                let Some(engine) = weak.upgrade() else { return };
                match serde_json::from_value::<TypingEvent>(payload) {
                    Ok(event) => {
                        tokio::spawn(async move {
                            engine.handle_remote_typing(event.sender_id, false).await;
                        });
                    }
                    Err(err) => warn!("sync: invalid typing-stop payload: {err}"),
                }
            }
        });

        // Bind before subscribing so no event slips between the two.
        let bindings = vec![
            realtime.bind(NEW_MESSAGE_EVENT, new_message),
            realtime.bind(TYPING_START_EVENT, typing_start),
            realtime.bind(TYPING_STOP_EVENT, typing_stop),
        ];
        {
            let mut guard = self.inner.lock().await;
            guard.bindings = bindings;
        }

        if let Err(err) = realtime.ensure_subscribed(&user).await {
            self.inner.lock().await.bindings.clear();
            if let ChatError::AccessDenied(reason) = &err {
                self.notify(EngineEvent::AccessDenied(reason.clone()));
            }
            return Err(err);
        }
        Ok(())
    }

    /// Releases the realtime subscription and every bound handler. Safe to
    /// call repeatedly; used on local-user change and final shutdown.
    pub async fn teardown(&self) {
        let stop_target = {
            let mut guard = self.inner.lock().await;
            guard.bindings.clear();
            guard.partner_typing = false;
            let pending_stop = guard.tracker.submitted();
            guard.partner.clone().filter(|_| pending_stop.is_some())
        };
        if let Some(partner) = stop_target {
            self.post_typing(TypingAction::Stop, &partner).await;
        }
        if let Some(realtime) = &self.realtime {
            realtime.teardown().await;
        }
        debug!("sync: engine torn down");
    }

    /// A pushed message is a hint, not state: when it involves the current
    /// partner the engine refetches instead of trusting the payload, so
    /// server-side ordering and filtering always win.
    async fn handle_new_message(&self, message: ChatMessage) {
        let involves_current = {
            let guard = self.inner.lock().await;
            match &guard.partner {
                Some(partner) => message.sender_id == *partner || message.receiver_id == *partner,
                None => false,
            }
        };
        if !involves_current {
            debug!("sync: ignoring push for another conversation");
            return;
        }
        self.fetch_history().await;
    }

    async fn handle_remote_typing(&self, sender: UserId, started: bool) {
        let changed = {
            let mut guard = self.inner.lock().await;
            if guard.partner.as_ref() == Some(&sender) && guard.partner_typing != started {
                guard.partner_typing = started;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify(EngineEvent::TypingChanged(started));
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
