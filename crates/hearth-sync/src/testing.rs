//! Scripted in-memory backend for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use hearth_types::models::{MessageRecord, PresenceEntry, RoomKind, User};

use crate::backend::Backend;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Create(String, String),
    GetRoom(String),
    Join(String),
    Heartbeat(String),
    Presence(String),
    ServerTime,
    Refresh,
    ClearAuth,
}

pub struct MockBackend {
    user: Mutex<Option<User>>,
    state: Mutex<MockState>,
}

struct MockState {
    messages: Vec<MessageRecord>,
    list_error: Option<SyncError>,
    list_delay: Duration,
    create_results: VecDeque<Result<MessageRecord, SyncError>>,
    create_delay: Duration,
    next_id: u32,
    room_result: Result<(), SyncError>,
    join_result: Result<(), SyncError>,
    join_delay: Duration,
    heartbeat_result: Result<(), SyncError>,
    presence: VecDeque<Result<Vec<PresenceEntry>, SyncError>>,
    server_time: Result<DateTime<Utc>, SyncError>,
    refresh: VecDeque<Result<(), SyncError>>,
    calls: Vec<Call>,
}

pub fn user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        email: format!("{}@hearth.test", id),
        display_name: name.to_string(),
    }
}

pub fn record(id: &str, room: &str, author: &str, body: &str, created: DateTime<Utc>) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        room: room.to_string(),
        author: author.to_string(),
        author_name: author.to_uppercase(),
        body: body.to_string(),
        created,
        expires_at: Some(created + TimeDelta::minutes(5)),
        expand: None,
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            user: Mutex::new(Some(user("me", "Me"))),
            state: Mutex::new(MockState {
                messages: Vec::new(),
                list_error: None,
                list_delay: Duration::ZERO,
                create_results: VecDeque::new(),
                create_delay: Duration::ZERO,
                next_id: 1,
                room_result: Ok(()),
                join_result: Ok(()),
                join_delay: Duration::ZERO,
                heartbeat_result: Ok(()),
                presence: VecDeque::new(),
                server_time: Ok(Utc::now()),
                refresh: VecDeque::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_messages(&self, messages: Vec<MessageRecord>) {
        self.state().messages = messages;
    }

    pub fn set_list_error(&self, err: Option<SyncError>) {
        self.state().list_error = err;
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.state().list_delay = delay;
    }

    pub fn push_create_result(&self, result: Result<MessageRecord, SyncError>) {
        self.state().create_results.push_back(result);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = delay;
    }

    pub fn set_room_result(&self, result: Result<(), SyncError>) {
        self.state().room_result = result;
    }

    pub fn set_join_delay(&self, delay: Duration) {
        self.state().join_delay = delay;
    }

    pub fn set_join_result(&self, result: Result<(), SyncError>) {
        self.state().join_result = result;
    }

    pub fn set_heartbeat_result(&self, result: Result<(), SyncError>) {
        self.state().heartbeat_result = result;
    }

    /// Queue poll responses. The last one keeps being returned.
    pub fn push_presence(&self, result: Result<Vec<PresenceEntry>, SyncError>) {
        self.state().presence.push_back(result);
    }

    pub fn set_server_time(&self, result: Result<DateTime<Utc>, SyncError>) {
        self.state().server_time = result;
    }

    /// Queue auth refresh outcomes. Defaults to success once drained.
    pub fn push_refresh(&self, result: Result<(), SyncError>) {
        self.state().refresh.push_back(result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn record_call(&self, call: Call) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn current_user(&self) -> Option<User> {
        self.user.lock().unwrap().clone()
    }

    fn clear_auth(&self) {
        self.record_call(Call::ClearAuth);
        *self.user.lock().unwrap() = None;
    }

    async fn list_messages(
        &self,
        _kind: RoomKind,
        room_id: &str,
        page_size: u32,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        self.record_call(Call::List(room_id.to_string()));
        let delay = self.state().list_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        if let Some(err) = &state.list_error {
            return Err(err.clone());
        }
        let mut page: Vec<MessageRecord> = state
            .messages
            .iter()
            .filter(|m| m.room == room_id)
            .cloned()
            .collect();
        let excess = page.len().saturating_sub(page_size as usize);
        page.drain(..excess);
        Ok(page)
    }

    async fn create_message(
        &self,
        kind: RoomKind,
        room_id: &str,
        body: &str,
    ) -> Result<MessageRecord, SyncError> {
        self.record_call(Call::Create(room_id.to_string(), body.to_string()));
        let delay = self.state().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(result) = state.create_results.pop_front() {
            return result;
        }

        let id = format!("srv{}", state.next_id);
        state.next_id += 1;
        let mut rec = record(&id, room_id, "me", body, Utc::now());
        rec.author_name = "Me".into();
        if !kind.expires() {
            rec.expires_at = None;
        }
        state.messages.push(rec.clone());
        Ok(rec)
    }

    async fn get_room(&self, _kind: RoomKind, room_id: &str) -> Result<(), SyncError> {
        self.record_call(Call::GetRoom(room_id.to_string()));
        self.state().room_result.clone()
    }

    async fn join_room(&self, room_id: &str) -> Result<(), SyncError> {
        self.record_call(Call::Join(room_id.to_string()));
        let delay = self.state().join_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state().join_result.clone()
    }

    async fn heartbeat(&self, room_id: &str) -> Result<(), SyncError> {
        self.record_call(Call::Heartbeat(room_id.to_string()));
        self.state().heartbeat_result.clone()
    }

    async fn presence(&self, room_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        self.record_call(Call::Presence(room_id.to_string()));
        let mut state = self.state();
        if state.presence.len() > 1 {
            return state.presence.pop_front().unwrap_or(Ok(Vec::new()));
        }
        state.presence.front().cloned().unwrap_or(Ok(Vec::new()))
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, SyncError> {
        self.record_call(Call::ServerTime);
        self.state().server_time.clone()
    }

    async fn auth_refresh(&self) -> Result<User, SyncError> {
        self.record_call(Call::Refresh);
        let outcome = self.state().refresh.pop_front().unwrap_or(Ok(()));
        outcome?;
        self.current_user().ok_or(SyncError::NoSession)
    }
}
