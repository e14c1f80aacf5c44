use serde::{Deserialize, Serialize};

use crate::models::MessageRecord;

/// What happened to a record, as reported by the push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

/// A single per-record notification from a collection subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub action: RecordAction,
    pub record: MessageRecord,
}

/// Events delivered by the push channel to the rest of the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// The channel (re)connected. Fired on every connection, including the first.
    Connected { client_id: String },

    /// The channel lost its connection. Events sent meanwhile are never replayed.
    Disconnected,

    /// A record changed in a subscribed collection.
    Record { collection: String, event: RecordEvent },
}

/// Body of the connect frame the server sends first on every realtime stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectFrame {
    #[serde(rename = "clientId")]
    pub client_id: String,
}

/// Subscription topic covering every record of a collection.
pub fn collection_topic(collection: &str) -> String {
    format!("{}/*", collection)
}

/// Inverse of [`collection_topic`].
pub fn topic_collection(topic: &str) -> &str {
    topic.split('/').next().unwrap_or(topic)
}
