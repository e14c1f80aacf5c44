//! Network side of the Hearth client: REST backend and realtime transport.

pub mod http;
pub mod realtime;
pub mod sse;

pub use http::HttpBackend;
pub use realtime::run_realtime;
