//! One open conversation: the task that owns its store and timers.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hearth_types::models::{Message, MessageRecord, PresenceEntry, RoomKind};

use crate::connection::ConnectionState;
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::expiry::ExpiryScheduler;
use crate::presence::PresenceTracker;
use crate::realtime::SubscriptionEvent;
use crate::resync::ResyncCoordinator;
use crate::session::SessionState;
use crate::store::{MessageStore, SendOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Loading,
    Ready,
    /// The room does not exist or is not visible to us. Terminal.
    NotFound,
    /// Credentials were rejected. Terminal until the user logs in again.
    SessionEnded,
}

impl RoomStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::NotFound | Self::SessionEnded)
    }
}

/// What the UI renders for a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub status: RoomStatus,
    /// Oldest first. Expired messages are never included.
    pub messages: Vec<Message>,
}

enum Command {
    Send(String),
    Resync,
}

type SendResult = (String, Result<MessageRecord, SyncError>);

/// Owner side of an open room. Dropping it closes the room.
pub struct RoomHandle {
    kind: RoomKind,
    room_id: String,
    commands: mpsc::UnboundedSender<Command>,
    view_rx: watch::Receiver<RoomView>,
    presence_rx: Option<watch::Receiver<Vec<PresenceEntry>>>,
    cancel: CancellationToken,
}

impl RoomHandle {
    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Post a message. It shows up immediately as a placeholder and is either
    /// confirmed or removed once the server answers.
    pub fn send(&self, body: impl Into<String>) -> Result<(), SyncError> {
        self.commands
            .send(Command::Send(body.into()))
            .map_err(|_| SyncError::NoSession)
    }

    /// Refetch the page regardless of connection state.
    pub fn resync(&self) -> Result<(), SyncError> {
        self.commands
            .send(Command::Resync)
            .map_err(|_| SyncError::NoSession)
    }

    pub fn view(&self) -> RoomView {
        self.view_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomView> {
        self.view_rx.clone()
    }

    /// Presence roster, for room kinds that track presence.
    pub fn presence(&self) -> Option<watch::Receiver<Vec<PresenceEntry>>> {
        self.presence_rx.clone()
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct RoomSession {
    ctx: SyncContext,
    kind: RoomKind,
    room_id: String,
    status: RoomStatus,
    store: MessageStore,
    /// Only rooms whose messages carry a TTL get one.
    expiry: Option<ExpiryScheduler>,
    presence: Option<PresenceTracker>,
    view_tx: watch::Sender<RoomView>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    sends_tx: mpsc::UnboundedSender<SendResult>,
    sends_rx: mpsc::UnboundedReceiver<SendResult>,
    cancel: CancellationToken,
}

impl RoomSession {
    /// Open a room and start syncing it in the background.
    pub fn open(ctx: &SyncContext, kind: RoomKind, room_id: &str) -> RoomHandle {
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (sends_tx, sends_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(RoomView {
            status: RoomStatus::Loading,
            messages: Vec::new(),
        });

        let (presence, presence_rx) = if kind.requires_membership() {
            let mut tracker = PresenceTracker::new(ctx.backend.clone(), &ctx.config);
            let roster = tracker.start(room_id);
            (Some(tracker), Some(roster))
        } else {
            (None, None)
        };

        let expiry = kind
            .expires()
            .then(|| ExpiryScheduler::new(ctx.clock.clone(), &ctx.config));

        let session = RoomSession {
            ctx: ctx.clone(),
            kind,
            room_id: room_id.to_string(),
            status: RoomStatus::Loading,
            store: MessageStore::new(ctx.backend.clone(), ctx.clock.clone(), &ctx.config, kind, room_id),
            expiry,
            presence,
            view_tx,
            commands_tx: commands_tx.clone(),
            commands_rx,
            sends_tx,
            sends_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(session.run());

        RoomHandle {
            kind,
            room_id: room_id.to_string(),
            commands: commands_tx,
            view_rx,
            presence_rx,
            cancel,
        }
    }

    async fn run(mut self) {
        info!("Opening {:?} room {}", self.kind, self.room_id);

        if !self.ctx.session.is_active() {
            self.finish(RoomStatus::SessionEnded);
            return;
        }
        // Closing the handle must not wait on a slow server.
        let cancel = self.cancel.clone();
        let opened = tokio::select! {
            _ = cancel.cancelled() => false,
            opened = self.prepare() => opened,
        };
        if !opened {
            return;
        }

        // Subscribe before fetching so nothing sent during the fetch is lost.
        let mut subscription = self.ctx.realtime.subscribe(self.kind.collection());
        let mut offset_rx = self.ctx.clock.subscribe();
        let mut session_rx = self.ctx.session.subscribe();

        let monitor = self.ctx.realtime.monitor();
        let state_rx = monitor.subscribe();
        let mut coordinator = ResyncCoordinator::new(self.ctx.session.clone(), self.ctx.config.resync_debounce);
        if *state_rx.borrow() != ConnectionState::FirstConnecting {
            coordinator = coordinator.after_initial();
        }
        let resync_tx = self.commands_tx.clone();
        coordinator.spawn(state_rx, self.cancel.child_token(), move || {
            let _ = resync_tx.send(Command::Resync);
        });

        if !self.refetch_or_cancel().await {
            return;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(command) = self.commands_rx.recv() => {
                    match command {
                        Command::Send(body) => self.send(body),
                        Command::Resync => {
                            if !self.refetch_or_cancel().await {
                                return;
                            }
                        }
                    }
                }

                Some((placeholder_id, result)) = self.sends_rx.recv() => {
                    match self.store.reconcile(&placeholder_id, result) {
                        SendOutcome::Confirmed(id) => debug!("Send {} confirmed as {}", placeholder_id, id),
                        SendOutcome::AlreadyPresent(id) => debug!("Send {} already fetched as {}", placeholder_id, id),
                        SendOutcome::RolledBack | SendOutcome::Discarded => {}
                    }
                    self.publish();
                }

                Some(event) = subscription.recv() => {
                    match event {
                        SubscriptionEvent::Record(event) => {
                            if self.store.apply_remote_event(&event) {
                                self.publish();
                            }
                        }
                        SubscriptionEvent::Lagged(n) => {
                            warn!("Room {} missed {} realtime events, refetching", self.room_id, n);
                            if !self.refetch_or_cancel().await {
                                return;
                            }
                        }
                        // Reconnects reach us through the resync coordinator.
                        SubscriptionEvent::Connected | SubscriptionEvent::Disconnected => {}
                    }
                }

                Some(id) = next_expiry(&mut self.expiry) => {
                    debug!("Message {} expired in room {}", id, self.room_id);
                    self.store.evict(&id);
                    self.publish();
                }

                Ok(()) = offset_rx.changed(), if self.expiry.is_some() => {
                    offset_rx.borrow_and_update();
                    let expired = self
                        .expiry
                        .as_mut()
                        .map(|expiry| expiry.on_offset_change())
                        .unwrap_or_default();
                    if !expired.is_empty() {
                        for id in &expired {
                            self.store.evict(id);
                        }
                        self.publish();
                    }
                }

                Ok(()) = session_rx.changed() => {
                    if *session_rx.borrow_and_update() == SessionState::Invalidated {
                        self.finish(RoomStatus::SessionEnded);
                        return;
                    }
                }
            }
        }

        debug!("Room {} closed", self.room_id);
    }

    /// Confirm the room exists and, where needed, join it.
    async fn prepare(&mut self) -> bool {
        if !self.check_exists().await {
            return false;
        }
        !self.kind.requires_membership() || self.ensure_membership().await
    }

    /// Look the room up before anything else touches it.
    async fn check_exists(&mut self) -> bool {
        match self.ctx.backend.get_room(self.kind, &self.room_id).await {
            Ok(()) => true,
            Err(SyncError::NotFound(what)) => {
                warn!("Room {} not found: {}", self.room_id, what);
                self.finish(RoomStatus::NotFound);
                false
            }
            Err(e) if e.is_session_fatal() => {
                self.ctx.session.invalidate();
                self.finish(RoomStatus::SessionEnded);
                false
            }
            Err(e) => {
                warn!("Failed to look up room {}, loading anyway: {}", self.room_id, e);
                true
            }
        }
    }

    /// Join the room, treating "already a member" as success.
    /// Returns `false` if the room can't be opened.
    async fn ensure_membership(&mut self) -> bool {
        match self.ctx.backend.join_room(&self.room_id).await {
            Ok(()) => true,
            Err(SyncError::Conflict) => {
                debug!("Already a member of room {}", self.room_id);
                true
            }
            Err(SyncError::NotFound(what)) => {
                warn!("Room {} not found: {}", self.room_id, what);
                self.finish(RoomStatus::NotFound);
                false
            }
            Err(e) if e.is_session_fatal() => {
                self.ctx.session.invalidate();
                self.finish(RoomStatus::SessionEnded);
                false
            }
            Err(e) => {
                warn!("Failed to join room {}, loading anyway: {}", self.room_id, e);
                true
            }
        }
    }

    /// `refetch`, abandoned as soon as the room is closed.
    async fn refetch_or_cancel(&mut self) -> bool {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => false,
            ok = self.refetch() => ok,
        }
    }

    /// Replace the view with a fresh page. Returns `false` if the room
    /// reached a terminal state.
    async fn refetch(&mut self) -> bool {
        match self.store.load().await {
            Ok(count) => {
                debug!("Loaded {} messages for room {}", count, self.room_id);
            }
            Err(SyncError::NotFound(what)) => {
                warn!("Room {} not found: {}", self.room_id, what);
                self.finish(RoomStatus::NotFound);
                return false;
            }
            Err(e) if e.is_session_fatal() => {
                self.ctx.session.invalidate();
                self.finish(RoomStatus::SessionEnded);
                return false;
            }
            Err(e) => {
                // The next reconnect or manual resync tries again.
                warn!("Failed to load room {}: {}", self.room_id, e);
            }
        }

        if self.status == RoomStatus::Loading {
            info!("Room {} ready", self.room_id);
        }
        self.status = RoomStatus::Ready;
        self.publish();
        true
    }

    fn send(&mut self, body: String) {
        if body.trim().is_empty() {
            return;
        }

        let pending = self.store.send_optimistic(&body);
        self.publish();

        let backend = self.ctx.backend.clone();
        let sends_tx = self.sends_tx.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            let result = backend.create_message(kind, &pending.room_id, &pending.body).await;
            // Nobody is listening once the room is closed.
            let _ = sends_tx.send((pending.placeholder_id, result));
        });
    }

    /// Sync expiry timers with the store, drop what has expired and push the view out.
    fn publish(&mut self) {
        if let Some(expiry) = self.expiry.as_mut() {
            for id in expiry.track(self.store.messages()) {
                debug!("Message {} already expired in room {}", id, self.room_id);
                self.store.evict(&id);
            }
        }

        self.view_tx.send_replace(RoomView {
            status: self.status,
            messages: self.store.messages().to_vec(),
        });
    }

    fn finish(&mut self, status: RoomStatus) {
        self.status = status;
        self.presence = None;
        if let Some(expiry) = self.expiry.as_mut() {
            expiry.clear();
        }
        self.view_tx.send_modify(|view| view.status = status);
        self.cancel.cancel();
    }
}

async fn next_expiry(expiry: &mut Option<ExpiryScheduler>) -> Option<String> {
    match expiry {
        Some(scheduler) if !scheduler.is_empty() => scheduler.next_expired().await,
        _ => std::future::pending().await,
    }
}
