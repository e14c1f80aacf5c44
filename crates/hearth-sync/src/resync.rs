//! Recovery after push channel reconnects.
//!
//! The server never replays events missed while disconnected, so every
//! reconnection is followed by a session check and a full refetch.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    /// The first connection. State comes from the explicit initial load.
    Initial,
    Reconnect,
}

pub struct ResyncCoordinator {
    session: Session,
    debounce: Duration,
    seen_initial: bool,
}

impl ResyncCoordinator {
    pub fn new(session: Session, debounce: Duration) -> Self {
        Self {
            session,
            debounce,
            seen_initial: false,
        }
    }

    /// Start as if the initial connection already happened, for owners
    /// created while the channel is up.
    pub fn after_initial(mut self) -> Self {
        self.seen_initial = true;
        self
    }

    /// Classify a connect notification.
    pub fn on_connect(&mut self) -> ConnectKind {
        if self.seen_initial {
            ConnectKind::Reconnect
        } else {
            self.seen_initial = true;
            ConnectKind::Initial
        }
    }

    /// Watch the connection state and call `on_resync` after each reconnect
    /// whose session check passes. Connects within the debounce window are
    /// coalesced into one resync. Stops for good once the session is rejected.
    pub fn spawn<F>(
        self,
        state_rx: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
        on_resync: F,
    ) -> JoinHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        tokio::spawn(self.run(state_rx, cancel, on_resync))
    }

    async fn run<F>(
        mut self,
        mut state_rx: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
        on_resync: F,
    ) where
        F: Fn() + Send + Sync + 'static,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            if *state_rx.borrow_and_update() != ConnectionState::Connected {
                continue;
            }
            if self.on_connect() == ConnectKind::Initial {
                debug!("Initial realtime connect, no resync needed");
                continue;
            }

            // Swallow the rest of a reconnect burst.
            let settle = tokio::time::sleep(self.debounce);
            tokio::pin!(settle);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = &mut settle => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        state_rx.borrow_and_update();
                    }
                }
            }

            if let Err(e) = self.session.refresh().await {
                warn!("Session check failed after reconnect, stopping resync: {}", e);
                return;
            }

            info!("Reconnected, refetching state");
            on_resync();
        }
    }
}
