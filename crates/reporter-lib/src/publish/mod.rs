//! Record delivery to the remote collector
//!
//! This module handles:
//! - The [`Sink`] transport abstraction and its TCP/UDP implementation
//! - The [`Publisher`], which falls back to the offline cache while the
//!   remote is unreachable and replays the backlog on recovery

mod publisher;
mod sink;


pub use publisher::{
    Publisher, PublisherBuilder, PublisherConfig, RemoteStatus, RetryControl,
    DEFAULT_MAX_FAST_ATTEMPTS, FAST_RETRY_INTERVAL,
};
pub use sink::{NetworkSink, Sink, Transport};
