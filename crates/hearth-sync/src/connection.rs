use std::fmt;

use tokio::sync::watch;
use tracing::{info, warn};

/// Push channel connection state as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been established yet.
    FirstConnecting,
    Connected,
    /// The channel dropped and the transport is retrying. May last indefinitely.
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::FirstConnecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Tracks the push channel's lifecycle.
///
/// Only channel lifecycle notifications move the state; there is no terminal
/// state and no assumption about how long the transport keeps retrying.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    state_tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::FirstConnecting);
        Self { state_tx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The channel's connect notification. Returns the previous state.
    pub fn on_connect(&self) -> ConnectionState {
        let previous = self.state_tx.send_replace(ConnectionState::Connected);
        match previous {
            ConnectionState::FirstConnecting => info!("Realtime channel connected"),
            ConnectionState::Reconnecting => info!("Realtime channel reconnected"),
            ConnectionState::Connected => {}
        }
        previous
    }

    /// A detected disconnect. Returns the previous state.
    pub fn on_disconnect(&self) -> ConnectionState {
        let previous = self.state_tx.send_replace(ConnectionState::Reconnecting);
        if previous == ConnectionState::Connected {
            warn!("Realtime channel lost, reconnecting");
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let monitor = ConnectionMonitor::new();
        assert_eq!(monitor.state(), ConnectionState::FirstConnecting);

        monitor.on_connect();
        assert!(monitor.state().is_connected());

        monitor.on_disconnect();
        assert_eq!(monitor.state(), ConnectionState::Reconnecting);

        // Any number of failed retries keeps it reconnecting.
        monitor.on_disconnect();
        monitor.on_disconnect();
        assert_eq!(monitor.state(), ConnectionState::Reconnecting);

        assert_eq!(monitor.on_connect(), ConnectionState::Reconnecting);
        assert_eq!(monitor.state(), ConnectionState::Connected);
    }

    #[test]
    fn disconnect_before_first_connect_is_reconnecting() {
        let monitor = ConnectionMonitor::new();
        monitor.on_disconnect();
        assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.on_connect();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }
}
