/// Shared types for the chat client: backend payloads and view events
use crate::feed::{FeedKind, FeedState};
use crate::thread::ThreadSnapshot;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                s.trim().parse::<i64>().map($name)
            }
        }
    };
}

id_type!(
    /// Conversation identifier
    RoomId
);
id_type!(
    /// Message identifier, also the recency key of a conversation
    MessageId
);
id_type!(UserId);

/// Conversation kind as tagged by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// Direct conversation between two users
    #[serde(rename = "oneone")]
    Direct,
    /// Private group
    Group,
    /// Public group
    Public,
    #[serde(other)]
    Other,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Direct => "oneone",
            RoomKind::Group => "group",
            RoomKind::Public => "public",
            RoomKind::Other => "other",
        }
    }
}

impl std::str::FromStr for RoomKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "oneone" | "direct" => Ok(RoomKind::Direct),
            "group" | "private" => Ok(RoomKind::Group),
            "public" => Ok(RoomKind::Public),
            other => Err(format!("unknown room type: {}", other)),
        }
    }
}

/// Summary of one conversation for the room list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub room_id: RoomId,
    #[serde(default)]
    pub name: String,
    /// Preview text of the last message
    #[serde(default)]
    pub last_message: String,
    /// Identifier of the last message; absent sorts as 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RoomKind>,
}

impl ConversationSummary {
    /// Recency key used for ordering
    pub fn recency(&self) -> MessageId {
        self.last_message_id.unwrap_or(MessageId(0))
    }

    pub fn is_unseen(&self) -> bool {
        self.seen == Some(false)
    }
}

/// Incremental update pushed on the room feed (`"event": "room_update"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUpdate {
    pub room_id: RoomId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub seen: Option<bool>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<RoomKind>,
}

impl RoomUpdate {
    /// Overwrite the fields this update carries; fields it omits keep their value.
    pub fn apply_to(&self, room: &mut ConversationSummary) {
        if let Some(name) = &self.name {
            room.name = name.clone();
        }
        if let Some(last_message) = &self.last_message {
            room.last_message = last_message.clone();
        }
        if self.last_message_id.is_some() {
            room.last_message_id = self.last_message_id;
        }
        if self.seen.is_some() {
            room.seen = self.seen;
        }
        if self.avatar.is_some() {
            room.avatar = self.avatar.clone();
        }
        if self.kind.is_some() {
            room.kind = self.kind;
        }
    }

    pub fn into_summary(self) -> ConversationSummary {
        ConversationSummary {
            room_id: self.room_id,
            name: self.name.unwrap_or_default(),
            last_message: self.last_message.unwrap_or_default(),
            last_message_id: self.last_message_id,
            seen: self.seen,
            avatar: self.avatar,
            kind: self.kind,
        }
    }
}

/// Attachment kind: images are shown inline, everything else is a download link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    #[serde(other)]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub name: String,
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub link: String,
}

impl Attachment {
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            "Download File"
        } else {
            &self.name
        }
    }
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(default)]
    pub content: String,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(rename = "messageType", alias = "message_type", default)]
    pub message_type: String,
}

impl MessageRecord {
    pub fn attachments(&self) -> &[Attachment] {
        self.attachments.as_deref().unwrap_or(&[])
    }
}

/// Sender lookup entry pushed on a thread feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Participant {
    /// Avatar URL, treating blank strings as missing
    pub fn avatar_url(&self) -> Option<&str> {
        self.avatar
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Signed-in user as returned by `/auth/validate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(deserialize_with = "user_id_lenient")]
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub org: bool,
}

/// Editable profile fields (settings page)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSettings {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// User search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
}

/// State changes published by the runtime to UIs (TUI, SSE clients)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    /// The room list changed; carries the full ordered list
    RoomsUpdated { rooms: Vec<ConversationSummary> },
    /// The open thread changed; carries the full window
    ThreadUpdated { thread: ThreadSnapshot },
    /// The open thread was torn down
    ThreadClosed { room_id: RoomId },
    /// A live feed changed connection state
    FeedState { feed: FeedKind, state: FeedState },
}

fn user_id_lenient<'de, D>(deserializer: D) -> std::result::Result<UserId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(UserId(n)),
        Raw::Text(s) => s
            .parse::<UserId>()
            .map_err(|e| serde::de::Error::custom(format!("invalid user id {:?}: {}", s, e))),
    }
}
