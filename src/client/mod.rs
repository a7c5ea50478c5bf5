//! Client side of the live channel.
//!
//! - ExecutionView: Reconciles a reorderable event stream into one record
//! - ReconnectPolicy / Backoff: Capped exponential reconnect delays
//! - LiveClient: SSE follower that resyncs from a snapshot on every connect

pub mod backoff;
pub mod live;
pub mod view;

pub use backoff::{Backoff, ReconnectPolicy};
pub use live::{LiveClient, SseParser};
pub use view::ExecutionView;
