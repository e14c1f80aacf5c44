use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::time::{optional_timestamp, timestamp};

/// Prefix that marks a locally generated, not yet confirmed message id.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// Display name used when a record carries no author name at all.
pub const FALLBACK_DISPLAY_NAME: &str = "Wanderer";

pub fn is_placeholder_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

// -- Messages --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Optimistic,
    Confirmed,
}

/// A chat message as held by a room's message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub author_id: String,
    pub author_display_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// `None` for rooms whose messages never expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub origin: Origin,
}

impl Message {
    /// Build a confirmed message from a server record.
    pub fn from_record(record: MessageRecord) -> Self {
        let author_display_name = record.display_name().to_string();
        Self {
            id: record.id,
            room_id: record.room,
            author_id: record.author,
            author_display_name,
            body: record.body,
            created_at: record.created,
            expires_at: record.expires_at,
            origin: Origin::Confirmed,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.origin == Origin::Optimistic
    }
}

/// Message record as stored and returned by the backend.
///
/// Campfire and den messages are scoped by `room`; direct messages use `dm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    #[serde(alias = "dm")]
    pub room: String,
    pub author: String,
    #[serde(default)]
    pub author_name: String,
    pub body: String,
    #[serde(with = "timestamp")]
    pub created: DateTime<Utc>,
    #[serde(default, with = "optional_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<RecordExpand>,
}

impl MessageRecord {
    /// Denormalised author name, falling back to the expanded author relation.
    pub fn display_name(&self) -> &str {
        if !self.author_name.is_empty() {
            return &self.author_name;
        }
        self.expand
            .as_ref()
            .and_then(|e| e.author.as_ref())
            .map(|a| a.display_name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(FALLBACK_DISPLAY_NAME)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordExpand {
    #[serde(default)]
    pub author: Option<AuthorExpand>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorExpand {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: String,
}

// -- Users --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

impl User {
    pub fn display_name(&self) -> &str {
        if !self.display_name.is_empty() {
            &self.display_name
        } else if !self.email.is_empty() {
            &self.email
        } else {
            FALLBACK_DISPLAY_NAME
        }
    }
}

// -- Presence --

/// One user currently considered present in a room. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, alias = "updated_at", with = "optional_timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
}

// -- Rooms --

/// The three kinds of conversation a client can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Ephemeral room: every message carries a server-assigned TTL.
    Campfire,
    /// Permanent room.
    Den,
    /// One-to-one conversation.
    Direct,
}

impl RoomKind {
    /// Collection holding the room (or conversation) record itself.
    pub fn room_collection(self) -> &'static str {
        match self {
            Self::Campfire | Self::Den => "rooms",
            Self::Direct => "direct_messages",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            Self::Campfire | Self::Den => "messages",
            Self::Direct => "dm_messages",
        }
    }

    /// Record field that scopes a message to its conversation.
    pub fn scope_field(self) -> &'static str {
        match self {
            Self::Campfire | Self::Den => "room",
            Self::Direct => "dm",
        }
    }

    pub fn expires(self) -> bool {
        matches!(self, Self::Campfire)
    }

    pub fn requires_membership(self) -> bool {
        !matches!(self, Self::Direct)
    }

    /// Expiry given to an optimistic placeholder until the server assigns the real one.
    pub fn provisional_expiry(self, now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
        match self {
            Self::Campfire => Some(now + ttl),
            Self::Den => Some(permanent_expiry()),
            Self::Direct => None,
        }
    }
}

impl std::str::FromStr for RoomKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "campfire" => Ok(Self::Campfire),
            "den" => Ok(Self::Den),
            "dm" | "direct" => Ok(Self::Direct),
            other => Err(format!("unknown room kind '{}'", other)),
        }
    }
}

/// Far-future expiry the server stamps on messages in permanent rooms.
pub fn permanent_expiry() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2099, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
