//! Best-effort presence: periodic heartbeats plus roster polling.
//!
//! Nothing here is ever surfaced as an error; a failed heartbeat or poll is
//! simply retried on the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use hearth_types::models::PresenceEntry;

use crate::backend::Backend;
use crate::config::SyncConfig;

struct RoomPresence {
    cancel: CancellationToken,
    roster_tx: watch::Sender<Vec<PresenceEntry>>,
}

pub struct PresenceTracker {
    backend: Arc<dyn Backend>,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    rooms: HashMap<String, RoomPresence>,
}

impl PresenceTracker {
    pub fn new(backend: Arc<dyn Backend>, config: &SyncConfig) -> Self {
        Self {
            backend,
            heartbeat_interval: config.heartbeat_interval,
            poll_interval: config.presence_poll_interval,
            rooms: HashMap::new(),
        }
    }

    /// Start heartbeating and polling for a room. Both fire immediately.
    /// Starting a room that is already tracked returns its existing roster.
    pub fn start(&mut self, room_id: &str) -> watch::Receiver<Vec<PresenceEntry>> {
        if let Some(room) = self.rooms.get(room_id) {
            return room.roster_tx.subscribe();
        }

        let cancel = CancellationToken::new();
        let (roster_tx, roster_rx) = watch::channel(Vec::new());

        tokio::spawn(heartbeat_loop(
            self.backend.clone(),
            room_id.to_string(),
            self.heartbeat_interval,
            cancel.clone(),
        ));
        tokio::spawn(poll_loop(
            self.backend.clone(),
            room_id.to_string(),
            self.poll_interval,
            roster_tx.clone(),
            cancel.clone(),
        ));

        debug!("Presence tracking started for room {}", room_id);
        self.rooms.insert(room_id.to_string(), RoomPresence { cancel, roster_tx });
        roster_rx
    }

    /// Cancel both timers for a room.
    pub fn stop(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.remove(room_id) {
            room.cancel.cancel();
            debug!("Presence tracking stopped for room {}", room_id);
        }
    }

    pub fn is_tracking(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Users present according to the latest successful poll.
    pub fn roster(&self, room_id: &str) -> Vec<PresenceEntry> {
        self.rooms
            .get(room_id)
            .map(|room| room.roster_tx.borrow().clone())
            .unwrap_or_default()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        for room in self.rooms.values() {
            room.cancel.cancel();
        }
    }
}

async fn heartbeat_loop(
    backend: Arc<dyn Backend>,
    room_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = backend.heartbeat(&room_id).await {
                    debug!("Heartbeat for room {} failed: {}", room_id, e);
                }
            }
        }
    }
}

async fn poll_loop(
    backend: Arc<dyn Backend>,
    room_id: String,
    interval: Duration,
    roster_tx: watch::Sender<Vec<PresenceEntry>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match backend.presence(&room_id).await {
                    Ok(online) => {
                        trace!("Room {} has {} present", room_id, online.len());
                        roster_tx.send_replace(online);
                    }
                    Err(e) => debug!("Presence poll for room {} failed: {}", room_id, e),
                }
            }
        }
    }
}
