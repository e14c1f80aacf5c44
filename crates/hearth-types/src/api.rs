use serde::{Deserialize, Serialize};

use crate::models::{PresenceEntry, User};

// -- Auth --

#[derive(Debug, Serialize)]
pub struct PasswordAuthRequest {
    pub identity: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub record: User,
}

// -- Records --

/// One page of records from a collection list endpoint.
#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default)]
    pub page: u32,
    #[serde(rename = "perPage", default)]
    pub per_page: u32,
    #[serde(rename = "totalItems", default)]
    pub total_items: i64,
    pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct JoinRoomRequest {
    pub room: String,
    pub user: String,
    pub role: String,
}

/// Error body returned by the backend on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ErrorResponse {
    /// True when any field failed a uniqueness constraint.
    pub fn is_unique_violation(&self) -> bool {
        self.data
            .as_object()
            .map(|fields| {
                fields.values().any(|f| {
                    f.get("code").and_then(|c| c.as_str()) == Some("validation_not_unique")
                })
            })
            .unwrap_or(false)
    }
}

// -- Presence --

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub room_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PresenceResponse {
    #[serde(default)]
    pub online: Vec<PresenceEntry>,
    #[serde(default)]
    pub count: usize,
}

// -- Realtime --

#[derive(Debug, Serialize, Deserialize)]
pub struct RealtimeSubscribeRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub subscriptions: Vec<String>,
}
