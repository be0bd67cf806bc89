//! Realtime transport seam and private-channel subscription lifecycle.
//!
//! One live duplex connection, at most one private-channel subscription per
//! authenticated session, decoupled from which conversation is displayed.
//! All of a user's conversations multiplex over the single channel keyed to
//! the local user's sanitized subject id.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, Weak},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{private_channel_name, UserId},
    protocol::{ChannelAuthRequest, ChannelAuthorization},
};
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::{
    auth::TokenProvider,
    config::ClientConfig,
    error::{rejected, ChatError},
};

/// Handler for one named event. Receives the event's raw JSON payload.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

const CONNECTION_ESTABLISHED: &str = "connection-established";
const SUBSCRIBE: &str = "subscribe";
const UNSUBSCRIBE: &str = "unsubscribe";
const SUBSCRIPTION_SUCCEEDED: &str = "subscription-succeeded";
const SUBSCRIPTION_ERROR: &str = "subscription-error";

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens the duplex connection and returns the broker-assigned socket
    /// id. Idempotent: an already-open connection returns its existing id.
    async fn connect(&self) -> Result<String, ChatError>;

    /// Completes a private-channel subscription with the backend-issued
    /// authorization payload.
    async fn subscribe(
        &self,
        channel: &str,
        authorization: &ChannelAuthorization,
    ) -> Result<(), ChatError>;

    async fn unsubscribe(&self, channel: &str);

    /// Registers a handler for a named event. The returned handle owns the
    /// registration; dropping it unregisters the handler.
    fn bind(&self, event: &str, handler: EventHandler) -> EventBinding;

    async fn disconnect(&self);
}

#[derive(Default)]
struct BindingRegistry {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
}

impl BindingRegistry {
    fn bind(&mut self, event: &str, handler: EventHandler) -> u64 {
        self.next_id += 1;
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((self.next_id, handler));
        self.next_id
    }

    fn unbind(&mut self, event: &str, id: u64) {
        if let Some(bound) = self.handlers.get_mut(event) {
            bound.retain(|(bound_id, _)| *bound_id != id);
            if bound.is_empty() {
                self.handlers.remove(event);
            }
        }
    }

    fn snapshot(&self, event: &str) -> Vec<EventHandler> {
        self.handlers
            .get(event)
            .map(|bound| bound.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default()
    }
}

fn lock_registry(registry: &StdMutex<BindingRegistry>) -> std::sync::MutexGuard<'_, BindingRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owned handle for one event registration. Dropping it unregisters the
/// handler, so there is no unbind-by-name to get wrong.
pub struct EventBinding {
    registry: Weak<StdMutex<BindingRegistry>>,
    event: String,
    id: u64,
}

impl Drop for EventBinding {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock_registry(&registry).unbind(&self.event, self.id);
        }
    }
}

impl std::fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBinding")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

/// Wire framing of the pub/sub broker: JSON text frames carrying an event
/// name, an optional channel, and the payload.
#[derive(Debug, Serialize, Deserialize)]
struct TransportFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    event: String,
    #[serde(default)]
    data: Value,
}

type WsWriter = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Default)]
struct WsConnection {
    writer: Option<WsWriter>,
    reader_task: Option<JoinHandle<()>>,
    socket_id: Option<String>,
}

/// Websocket-backed [`RealtimeTransport`]. A background task pumps incoming
/// frames into the binding registry; outgoing control frames (subscribe,
/// unsubscribe) go through the write half.
pub struct WebsocketTransport {
    ws_url: String,
    registry: Arc<StdMutex<BindingRegistry>>,
    inner: Mutex<WsConnection>,
}

impl WebsocketTransport {
    /// `base_url` is the broker's http(s) origin; the websocket endpoint is
    /// derived by scheme swap.
    pub fn new(base_url: &str) -> Result<Self, ChatError> {
        let ws_url = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ChatError::Transport(format!(
                "base url must start with http:// or https://: {base_url}"
            )));
        };
        Ok(Self {
            ws_url,
            registry: Arc::new(StdMutex::new(BindingRegistry::default())),
            inner: Mutex::new(WsConnection::default()),
        })
    }

    async fn send_frame(&self, frame: &TransportFrame) -> Result<(), ChatError> {
        let text = serde_json::to_string(frame)
            .map_err(|err| ChatError::Transport(format!("failed to encode frame: {err}")))?;
        let mut guard = self.inner.lock().await;
        let writer = guard
            .writer
            .as_mut()
            .ok_or_else(|| ChatError::Transport("not connected".into()))?;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|err| ChatError::Transport(format!("send failed: {err}")))
    }
}

fn dispatch_frame(registry: &StdMutex<BindingRegistry>, frame: TransportFrame) {
    match frame.event.as_str() {
        SUBSCRIPTION_SUCCEEDED => {
            info!(
                channel = frame.channel.as_deref().unwrap_or(""),
                "transport: subscription established"
            );
        }
        SUBSCRIPTION_ERROR => {
            error!(
                channel = frame.channel.as_deref().unwrap_or(""),
                "transport: subscription error: {}", frame.data
            );
        }
        _ => {}
    }

    let handlers = lock_registry(registry).snapshot(&frame.event);
    if handlers.is_empty() {
        debug!("transport: no handler bound for event {}", frame.event);
        return;
    }
    for handler in handlers {
        handler(frame.data.clone());
    }
}

#[async_trait]
impl RealtimeTransport for WebsocketTransport {
    async fn connect(&self) -> Result<String, ChatError> {
        let mut guard = self.inner.lock().await;
        if let Some(socket_id) = &guard.socket_id {
            return Ok(socket_id.clone());
        }

        let (stream, _) = connect_async(&self.ws_url)
            .await
            .map_err(|err| ChatError::Transport(format!("failed to connect {}: {err}", self.ws_url)))?;
        let (writer, mut reader) = stream.split();

        // The broker greets with its assigned socket id before anything else.
        let socket_id = loop {
            let message = reader
                .next()
                .await
                .ok_or_else(|| ChatError::Transport("connection closed during handshake".into()))?
                .map_err(|err| ChatError::Transport(format!("handshake failed: {err}")))?;
            match message {
                Message::Text(text) => {
                    let frame: TransportFrame = serde_json::from_str(&text).map_err(|err| {
                        ChatError::Transport(format!("invalid handshake frame: {err}"))
                    })?;
                    if frame.event == CONNECTION_ESTABLISHED {
                        let socket_id = frame
                            .data
                            .get("socket_id")
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                ChatError::Transport("handshake frame missing socket_id".into())
                            })?;
                        break socket_id.to_string();
                    }
                    debug!("transport: ignoring pre-handshake event {}", frame.event);
                }
                Message::Close(_) => {
                    return Err(ChatError::Transport(
                        "connection closed during handshake".into(),
                    ));
                }
                _ => {}
            }
        };

        let registry = Arc::clone(&self.registry);
        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<TransportFrame>(&text) {
                        Ok(frame) => dispatch_frame(&registry, frame),
                        Err(err) => warn!("transport: dropping malformed frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("transport: reader loop ended");
        });

        guard.writer = Some(writer);
        guard.reader_task = Some(reader_task);
        guard.socket_id = Some(socket_id.clone());
        info!(socket_id = %socket_id, "transport: connected");
        Ok(socket_id)
    }

    async fn subscribe(
        &self,
        channel: &str,
        authorization: &ChannelAuthorization,
    ) -> Result<(), ChatError> {
        self.send_frame(&TransportFrame {
            channel: Some(channel.to_string()),
            event: SUBSCRIBE.to_string(),
            data: serde_json::json!({
                "channel": channel,
                "auth": authorization.auth,
                "channel_data": authorization.channel_data,
            }),
        })
        .await
    }

    async fn unsubscribe(&self, channel: &str) {
        let frame = TransportFrame {
            channel: Some(channel.to_string()),
            event: UNSUBSCRIBE.to_string(),
            data: serde_json::json!({ "channel": channel }),
        };
        if let Err(err) = self.send_frame(&frame).await {
            debug!("transport: unsubscribe {channel} skipped: {err}");
        }
    }

    fn bind(&self, event: &str, handler: EventHandler) -> EventBinding {
        let id = lock_registry(&self.registry).bind(event, handler);
        EventBinding {
            registry: Arc::downgrade(&self.registry),
            event: event.to_string(),
            id,
        }
    }

    async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut writer) = guard.writer.take() {
            let _ = writer.send(Message::Close(None)).await;
        }
        if let Some(task) = guard.reader_task.take() {
            task.abort();
        }
        guard.socket_id = None;
    }
}

/// Obtains backend-issued authorization for a private-channel subscription.
pub struct ChannelAuthorizer {
    http: reqwest::Client,
    config: ClientConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl ChannelAuthorizer {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            tokens,
        }
    }

    /// One request/response round-trip. A 401/403 is an access-denied
    /// outcome: terminal, surfaced prominently, never retried here.
    pub async fn authorize(
        &self,
        socket_id: &str,
        channel_name: &str,
    ) -> Result<ChannelAuthorization, ChatError> {
        let token = self.tokens.bearer_token(&self.config.auth_audience).await?;
        let response = self
            .http
            .post(self.config.endpoint("/pusher/auth"))
            .bearer_auth(token)
            .json(&ChannelAuthRequest {
                socket_id: socket_id.to_string(),
                channel_name: channel_name.to_string(),
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            let message = match rejected(response).await {
                ChatError::BackendRejected { message, .. } => message,
                other => other.to_string(),
            };
            return Err(ChatError::AccessDenied(message));
        }
        if !status.is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Subscribing,
    Subscribed,
    TearingDown,
}

struct SessionState {
    state: SubscriptionState,
    user: Option<UserId>,
    channel: Option<String>,
    denied: Option<String>,
}

/// Owns the one private-channel subscription of an authenticated session.
/// Re-entrancy is prevented by the state flag, not locks held across IO.
pub struct RealtimeSession {
    transport: Arc<dyn RealtimeTransport>,
    authorizer: ChannelAuthorizer,
    inner: Mutex<SessionState>,
}

impl RealtimeSession {
    pub fn new(transport: Arc<dyn RealtimeTransport>, authorizer: ChannelAuthorizer) -> Self {
        Self {
            transport,
            authorizer,
            inner: Mutex::new(SessionState {
                state: SubscriptionState::Disconnected,
                user: None,
                channel: None,
                denied: None,
            }),
        }
    }

    pub async fn state(&self) -> SubscriptionState {
        self.inner.lock().await.state
    }

    /// Reason for a terminal access-denied outcome, if one occurred.
    pub async fn denied(&self) -> Option<String> {
        self.inner.lock().await.denied.clone()
    }

    pub fn bind(&self, event: &str, handler: EventHandler) -> EventBinding {
        self.transport.bind(event, handler)
    }

    /// Idempotent setup: a duplicate request while setup for the same user
    /// is in flight or complete is a no-op. A different user tears the old
    /// subscription down first.
    pub async fn ensure_subscribed(&self, user: &UserId) -> Result<(), ChatError> {
        let needs_teardown = {
            let mut guard = self.inner.lock().await;
            match guard.state {
                SubscriptionState::Connecting
                | SubscriptionState::Subscribing
                | SubscriptionState::Subscribed
                    if guard.user.as_ref() == Some(user) =>
                {
                    debug!(user = %user, "transport: subscription already set up");
                    return Ok(());
                }
                SubscriptionState::TearingDown => {
                    return Err(ChatError::Transport(
                        "subscription teardown in progress".into(),
                    ));
                }
                SubscriptionState::Disconnected => {
                    guard.state = SubscriptionState::Connecting;
                    guard.user = Some(user.clone());
                    guard.denied = None;
                    false
                }
                _ => true,
            }
        };

        if needs_teardown {
            self.teardown().await;
            let mut guard = self.inner.lock().await;
            guard.state = SubscriptionState::Connecting;
            guard.user = Some(user.clone());
            guard.denied = None;
        }

        match self.establish(user).await {
            Ok(channel) => {
                let mut guard = self.inner.lock().await;
                guard.state = SubscriptionState::Subscribed;
                guard.channel = Some(channel);
                Ok(())
            }
            Err(err) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.state = SubscriptionState::Disconnected;
                    guard.user = None;
                    guard.channel = None;
                    if let ChatError::AccessDenied(reason) = &err {
                        guard.denied = Some(reason.clone());
                    }
                }
                self.transport.disconnect().await;
                Err(err)
            }
        }
    }

    async fn establish(&self, user: &UserId) -> Result<String, ChatError> {
        let socket_id = self.transport.connect().await?;
        {
            let mut guard = self.inner.lock().await;
            guard.state = SubscriptionState::Subscribing;
        }
        let channel = private_channel_name(user);
        let authorization = self.authorizer.authorize(&socket_id, &channel).await?;
        self.transport.subscribe(&channel, &authorization).await?;
        info!(user = %user, channel = %channel, "transport: private channel subscribed");
        Ok(channel)
    }

    /// Paired teardown: unsubscribe the channel, release the connection,
    /// reset state. Safe to call when nothing is set up. Event bindings are
    /// handles owned by their binder; dropping them unregisters.
    pub async fn teardown(&self) {
        let channel = {
            let mut guard = self.inner.lock().await;
            if guard.state == SubscriptionState::Disconnected && guard.channel.is_none() {
                guard.user = None;
                return;
            }
            guard.state = SubscriptionState::TearingDown;
            guard.channel.take()
        };

        if let Some(channel) = &channel {
            self.transport.unsubscribe(channel).await;
        }
        self.transport.disconnect().await;

        let mut guard = self.inner.lock().await;
        guard.state = SubscriptionState::Disconnected;
        guard.user = None;
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
