use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Matrix message type (`msgtype`). Modelled as a closed enum so the router
/// can match exhaustively; anything we don't bridge lands in `Unhandled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Text,
    Notice,
    Location,
    Emote,
    Image,
    Video,
    Audio,
    File,
    Unhandled(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Text => "m.text",
            MessageKind::Notice => "m.notice",
            MessageKind::Location => "m.location",
            MessageKind::Emote => "m.emote",
            MessageKind::Image => "m.image",
            MessageKind::Video => "m.video",
            MessageKind::Audio => "m.audio",
            MessageKind::File => "m.file",
            MessageKind::Unhandled(raw) => raw,
        }
    }
}

impl From<String> for MessageKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "m.text" => MessageKind::Text,
            "m.notice" => MessageKind::Notice,
            "m.location" => MessageKind::Location,
            "m.emote" => MessageKind::Emote,
            "m.image" => MessageKind::Image,
            "m.video" => MessageKind::Video,
            "m.audio" => MessageKind::Audio,
            "m.file" => MessageKind::File,
            _ => MessageKind::Unhandled(raw),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Content of an `m.room.message` event. Fields the bridge doesn't rewrite
/// are carried through untouched via the flattened `extra` map, so relayed
/// events keep things like `external_url` or size info intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(rename = "msgtype")]
    pub kind: MessageKind,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    /// mxc URI of the media payload, for media message types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<MediaInfo>,
    /// Relation aggregation (replies, edits). Stripped before relaying since
    /// the relation target doesn't exist in destination rooms.
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Value>,
    /// Replacement content carried by edit events. Stripped before relaying;
    /// the plain-text fallback in `body` covers it.
    #[serde(rename = "m.new_content", skip_serializing_if = "Option::is_none")]
    pub new_content: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MessageContent {
    /// A bare plain-text message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            body: body.into(),
            format: None,
            formatted_body: None,
            url: None,
            info: None,
            relates_to: None,
            new_content: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// The `info` object of a media message. Only the thumbnail reference is
/// rewritten during relay; everything else passes through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(rename = "mimetype", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_info: Option<ThumbnailInfo>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThumbnailInfo {
    #[serde(rename = "mimetype", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A message event pulled from one homeserver's sync stream.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub sender: String,
    pub room: String,
    pub content: MessageContent,
}

/// Membership value of an `m.room.member` state event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    Join,
    Leave,
    Ban,
    Invite,
    Knock,
    Unknown(String),
}

impl MembershipState {
    pub fn is_leave_or_ban(&self) -> bool {
        matches!(self, MembershipState::Leave | MembershipState::Ban)
    }
}

impl From<String> for MembershipState {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "join" => MembershipState::Join,
            "leave" => MembershipState::Leave,
            "ban" => MembershipState::Ban,
            "invite" => MembershipState::Invite,
            "knock" => MembershipState::Knock,
            _ => MembershipState::Unknown(raw),
        }
    }
}

/// A membership change pulled from the sync stream. `state_key` is the user
/// the change applies to, not the sender.
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub room: String,
    pub state_key: String,
    pub membership: MembershipState,
}

/// One event from a sync batch, in arrival order within its room.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Message(InboundEvent),
    Membership(MembershipChange),
}

/// Result of one sync pull: the resume token plus the new events.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub next_batch: String,
    pub events: Vec<SyncEvent>,
}
