//! Message synchronization core for the Hearth chat client.
//!
//! Keeps one client's view of a room correct while optimistic sends, a lossy
//! push channel, server-side message TTLs and polled presence all interleave.

pub mod backend;
pub mod clock;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod expiry;
pub mod presence;
pub mod realtime;
pub mod resync;
pub mod room;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::Backend;
pub use context::{ContextGuard, SyncContext};
pub use error::SyncError;
pub use room::{RoomHandle, RoomSession, RoomStatus, RoomView};
