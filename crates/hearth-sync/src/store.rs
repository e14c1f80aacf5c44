//! Per-room message view.
//!
//! Merges the initial page fetch, push events and optimistic local sends into
//! one ordered, deduplicated list. Owned by a single task: every mutation goes
//! through `&mut self` and the invariants hold after each call.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::TimeDelta;
use tracing::debug;
use uuid::Uuid;

use hearth_types::events::{RecordAction, RecordEvent};
use hearth_types::models::{
    FALLBACK_DISPLAY_NAME, Message, MessageRecord, Origin, PLACEHOLDER_PREFIX, RoomKind,
};

use crate::backend::Backend;
use crate::clock::ClockSync;
use crate::config::SyncConfig;
use crate::error::SyncError;

/// A placeholder inserted by [`MessageStore::send_optimistic`] awaiting its create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub placeholder_id: String,
    pub room_id: String,
    pub body: String,
}

/// How a finished create call was folded into the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Placeholder replaced by the confirmed record with this id.
    Confirmed(String),
    /// The confirmed record was already present (fetched by a resync); placeholder dropped.
    AlreadyPresent(String),
    /// The create failed; placeholder removed.
    RolledBack,
    /// The placeholder was no longer in the view.
    Discarded,
}

pub struct MessageStore {
    backend: Arc<dyn Backend>,
    clock: ClockSync,
    kind: RoomKind,
    room_id: String,
    local_user_id: String,
    local_display_name: String,
    page_size: u32,
    provisional_ttl: TimeDelta,
    /// Sorted by `created_at`; ties keep insertion order.
    messages: Vec<Message>,
    /// Placeholder ids whose create call has not completed.
    pending: HashSet<String>,
}

impl MessageStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: ClockSync,
        config: &SyncConfig,
        kind: RoomKind,
        room_id: impl Into<String>,
    ) -> Self {
        let (local_user_id, local_display_name) = backend
            .current_user()
            .map(|u| (u.id.clone(), u.display_name().to_string()))
            .unwrap_or_else(|| (String::new(), FALLBACK_DISPLAY_NAME.to_string()));

        Self {
            backend,
            clock,
            kind,
            room_id: room_id.into(),
            local_user_id,
            local_display_name,
            page_size: config.page_size,
            provisional_ttl: TimeDelta::from_std(config.default_ttl).unwrap_or(TimeDelta::minutes(5)),
            messages: Vec::new(),
            pending: HashSet::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }

    /// Replace the view with the newest page from the server.
    ///
    /// Used for the initial load and for every resync. Placeholders whose
    /// create call is still in flight survive the replacement.
    pub async fn load(&mut self) -> Result<usize, SyncError> {
        let records = self
            .backend
            .list_messages(self.kind, &self.room_id, self.page_size)
            .await?;
        self.replace_page(records);
        Ok(self.messages.len())
    }

    /// Replace the view with an already fetched page.
    pub fn replace_page(&mut self, records: Vec<MessageRecord>) {
        let mut seen = HashSet::with_capacity(records.len());
        let mut fresh: Vec<Message> = records
            .into_iter()
            .filter(|r| r.room == self.room_id)
            .filter(|r| seen.insert(r.id.clone()))
            .map(Message::from_record)
            .collect();
        fresh.sort_by_key(|m| m.created_at);

        let placeholders: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| self.pending.contains(&m.id))
            .collect();

        self.messages = fresh;
        for placeholder in placeholders {
            self.insert_sorted(placeholder);
        }
        debug!("Loaded {} messages for room {}", self.messages.len(), self.room_id);
    }

    /// Fold a push notification into the view. Returns whether the view changed.
    pub fn apply_remote_event(&mut self, event: &RecordEvent) -> bool {
        let record = &event.record;
        if record.room != self.room_id {
            return false;
        }

        match event.action {
            RecordAction::Create => {
                // Own messages are represented by the optimistic path.
                if record.author == self.local_user_id || self.contains(&record.id) {
                    return false;
                }
                self.insert_sorted(Message::from_record(record.clone()));
                true
            }
            RecordAction::Update => {
                let Some(idx) = self.position(&record.id) else {
                    return false;
                };
                let updated = Message::from_record(record.clone());
                if self.messages[idx] == updated {
                    return false;
                }
                if self.messages[idx].created_at == updated.created_at {
                    self.messages[idx] = updated;
                } else {
                    self.messages.remove(idx);
                    self.insert_sorted(updated);
                }
                true
            }
            RecordAction::Delete => self.evict(&record.id).is_some(),
        }
    }

    /// Insert a placeholder for a local send and return what the create call needs.
    pub fn send_optimistic(&mut self, body: &str) -> PendingSend {
        let now = self.clock.now();
        let placeholder_id = format!("{}{}", PLACEHOLDER_PREFIX, Uuid::new_v4().simple());

        let placeholder = Message {
            id: placeholder_id.clone(),
            room_id: self.room_id.clone(),
            author_id: self.local_user_id.clone(),
            author_display_name: self.local_display_name.clone(),
            body: body.to_string(),
            created_at: now,
            expires_at: self.kind.provisional_expiry(now, self.provisional_ttl),
            origin: Origin::Optimistic,
        };

        self.pending.insert(placeholder_id.clone());
        self.insert_sorted(placeholder);

        PendingSend {
            placeholder_id,
            room_id: self.room_id.clone(),
            body: body.to_string(),
        }
    }

    /// Apply the result of a create call to its placeholder.
    pub fn reconcile(
        &mut self,
        placeholder_id: &str,
        result: Result<MessageRecord, SyncError>,
    ) -> SendOutcome {
        self.pending.remove(placeholder_id);
        let Some(idx) = self.position(placeholder_id) else {
            debug!("Send for {} finished after its placeholder left the view", placeholder_id);
            return SendOutcome::Discarded;
        };

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                debug!("Send failed in room {}, rolling back: {}", self.room_id, e);
                self.messages.remove(idx);
                return SendOutcome::RolledBack;
            }
        };

        self.messages.remove(idx);
        let id = record.id.clone();
        if self.contains(&id) {
            return SendOutcome::AlreadyPresent(id);
        }
        self.insert_sorted(Message::from_record(record));
        SendOutcome::Confirmed(id)
    }

    /// Remove a message locally, without a server round trip.
    pub fn evict(&mut self, id: &str) -> Option<Message> {
        let idx = self.position(id)?;
        self.pending.remove(id);
        Some(self.messages.remove(idx))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(idx, message);
    }
}
