use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, Presence, UserId};

fn default_message_type() -> String {
    "text".to_string()
}

/// One persisted (or optimistic) direct message. The chat backend speaks
/// camelCase, so the wire names follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// Opaque tag; the client never branches on anything but display.
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_status: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

/// Body of the channel-authorization round-trip. Field spelling is fixed by
/// the broker contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuthRequest {
    pub socket_id: String,
    pub channel_name: String,
}

/// Opaque payload the broker requires to complete a private-channel
/// subscription. The client carries it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAuthorization {
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub action: TypingAction,
    pub target_user_id: UserId,
}

/// Wire names of the events delivered on the per-user private channel. All
/// conversations multiplex over it; receivers filter by the payload's
/// sender/receiver fields.
pub const NEW_MESSAGE_EVENT: &str = "new-message";
pub const TYPING_START_EVENT: &str = "typing-start";
pub const TYPING_STOP_EVENT: &str = "typing-stop";

/// Payload of a `new-message` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub message: ChatMessage,
}

/// Payload of a `typing-start` / `typing-stop` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub sender_id: UserId,
}

/// Directory entry from the user roster endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub status: Presence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: Presence,
}
