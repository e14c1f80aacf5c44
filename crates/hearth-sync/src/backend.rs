use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hearth_types::models::{MessageRecord, PresenceEntry, RoomKind, User};

use crate::error::SyncError;

/// Everything the synchronization core needs from the server.
///
/// Implementations are shared behind an `Arc` and injected into each
/// component; nothing in this crate reaches for a global client.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<User>;

    /// Drop local credentials. Called once the session is known to be dead.
    fn clear_auth(&self);

    /// Newest page of messages for a room, returned oldest-first.
    async fn list_messages(
        &self,
        kind: RoomKind,
        room_id: &str,
        page_size: u32,
    ) -> Result<Vec<MessageRecord>, SyncError>;

    /// Create a message. The server assigns `id`, `created` and (for TTL rooms) `expires_at`.
    async fn create_message(
        &self,
        kind: RoomKind,
        room_id: &str,
        body: &str,
    ) -> Result<MessageRecord, SyncError>;

    /// Look up the room (or direct conversation) record. `NotFound` if it does not exist.
    async fn get_room(&self, kind: RoomKind, room_id: &str) -> Result<(), SyncError>;

    /// Join a room. Returns `Conflict` if already a member.
    async fn join_room(&self, room_id: &str) -> Result<(), SyncError>;

    async fn heartbeat(&self, room_id: &str) -> Result<(), SyncError>;

    async fn presence(&self, room_id: &str) -> Result<Vec<PresenceEntry>, SyncError>;

    /// Server's current wall-clock time, read from a lightweight endpoint.
    async fn server_time(&self) -> Result<DateTime<Utc>, SyncError>;

    /// Idempotent token refresh. Fails with `Unauthorized` once the session is invalid.
    async fn auth_refresh(&self) -> Result<User, SyncError>;
}
