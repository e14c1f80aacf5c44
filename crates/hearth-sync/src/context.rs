//! Process-wide sync state shared by every open room.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::Backend;
use crate::clock::ClockSync;
use crate::config::SyncConfig;
use crate::realtime::Realtime;
use crate::session::Session;

/// Everything a room needs, constructed once and passed by handle.
#[derive(Clone)]
pub struct SyncContext {
    pub backend: Arc<dyn Backend>,
    pub session: Session,
    pub clock: ClockSync,
    pub realtime: Realtime,
    pub config: Arc<SyncConfig>,
}

impl SyncContext {
    pub fn new(backend: Arc<dyn Backend>, config: SyncConfig) -> Self {
        Self {
            session: Session::new(backend.clone()),
            clock: ClockSync::new(backend.clone()),
            realtime: Realtime::new(),
            config: Arc::new(config),
            backend,
        }
    }

    /// Spawn the clock probe and token refresh loops.
    /// They run until the returned guard is dropped.
    pub fn start(&self) -> ContextGuard {
        let cancel = CancellationToken::new();

        tokio::spawn(
            self.clock
                .clone()
                .run(self.config.clock_resync_interval, cancel.clone()),
        );
        tokio::spawn(
            self.session
                .clone()
                .run(self.config.token_refresh_interval, cancel.clone()),
        );

        info!(
            "Sync context started (clock every {:?}, token refresh every {:?})",
            self.config.clock_resync_interval, self.config.token_refresh_interval
        );
        ContextGuard { cancel }
    }
}

/// Stops the background loops of a [`SyncContext`] when dropped.
pub struct ContextGuard {
    cancel: CancellationToken,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
