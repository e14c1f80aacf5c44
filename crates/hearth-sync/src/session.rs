use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use hearth_types::models::User;

use crate::backend::Backend;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// Credentials were rejected and cleared. Re-authentication is required.
    Invalidated,
}

/// Validity of the signed-in session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    backend: Arc<dyn Backend>,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let initial = if backend.current_user().is_some() {
            SessionState::Active
        } else {
            SessionState::Invalidated
        };
        let (state_tx, _) = watch::channel(initial);
        Self {
            inner: Arc::new(SessionInner { backend, state_tx }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Re-validate the session with a token refresh.
    ///
    /// Any failure ends the session: credentials are cleared and the error
    /// is returned. Nothing retries a failed refresh.
    pub async fn refresh(&self) -> Result<User, SyncError> {
        if !self.is_active() {
            return Err(SyncError::NoSession);
        }

        match self.inner.backend.auth_refresh().await {
            Ok(user) => Ok(user),
            Err(e) => {
                warn!("Auth refresh failed: {}", e);
                self.invalidate();
                Err(e)
            }
        }
    }

    /// Clear credentials and mark the session dead.
    pub fn invalidate(&self) {
        let previous = self.inner.state_tx.send_replace(SessionState::Invalidated);
        if previous == SessionState::Active {
            warn!("Session invalidated, clearing credentials");
            self.inner.backend.clear_auth();
        }
    }

    /// Refresh on every `interval` while the session stays active.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let mut state_rx = self.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow_and_update() == SessionState::Invalidated {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.refresh().await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, MockBackend};

    #[tokio::test]
    async fn rejected_refresh_invalidates_and_clears() {
        let backend = Arc::new(MockBackend::new());
        backend.push_refresh(Err(SyncError::Unauthorized));
        let session = Session::new(backend.clone());

        assert_eq!(session.refresh().await, Err(SyncError::Unauthorized));
        assert_eq!(session.state(), SessionState::Invalidated);
        assert_eq!(backend.count(|c| *c == Call::ClearAuth), 1);

        // No further refresh calls once dead.
        assert_eq!(session.refresh().await, Err(SyncError::NoSession));
        assert_eq!(backend.count(|c| *c == Call::Refresh), 1);
    }

    #[tokio::test]
    async fn network_failure_during_refresh_also_ends_session() {
        let backend = Arc::new(MockBackend::new());
        backend.push_refresh(Err(SyncError::Network("offline".into())));
        let session = Session::new(backend.clone());

        assert_eq!(session.refresh().await, Err(SyncError::Network("offline".into())));
        assert_eq!(session.state(), SessionState::Invalidated);
        assert_eq!(backend.count(|c| *c == Call::ClearAuth), 1);
        assert_eq!(session.refresh().await, Err(SyncError::NoSession));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_stops_after_server_error() {
        let backend = Arc::new(MockBackend::new());
        backend.push_refresh(Err(SyncError::Status { status: 503, message: "down".into() }));
        let session = Session::new(backend.clone());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(session.clone().run(Duration::from_secs(600), cancel.clone()));
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(backend.count(|c| *c == Call::Refresh), 1);
        assert_eq!(session.state(), SessionState::Invalidated);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_stops_after_invalidation() {
        let backend = Arc::new(MockBackend::new());
        backend.push_refresh(Ok(()));
        backend.push_refresh(Err(SyncError::Unauthorized));
        let session = Session::new(backend.clone());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(session.clone().run(Duration::from_secs(600), cancel.clone()));
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(backend.count(|c| *c == Call::Refresh), 2);
        assert_eq!(session.state(), SessionState::Invalidated);
        assert!(task.is_finished());
    }
}
