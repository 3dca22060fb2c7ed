//! Steward - command-and-control fabric for fleets of intermittently
//! connected nodes
//!
//! An operator publishes a message on any node; the fabric guarantees it
//! reaches the target node, the requested method runs there, and the reply
//! is routed back to the originator. Links may be lossy and nodes offline
//! at send time, so every in-flight message is persisted locally and
//! delivered at-least-once with per-subject FIFO ordering.
//!
//! ## Services
//!
//! - **Ring buffer**: sled-backed staging queue with crash-restart replay
//! - **Processes**: one publisher per outbound subject, one subscriber per
//!   served method, tracked in a registry with dynamic start/stop
//! - **Delivery**: per-message ACK/NACK over NATS with retry and timeouts
//! - **Auth**: ed25519 request signing plus a centrally maintained,
//!   hash-stamped ACL distributed to nodes
//! - **Error kernel**: central sink deciding what happens after a failure

pub mod auth;
pub mod config;
pub mod error;
pub mod error_kernel;
pub mod ingress;
pub mod message;
pub mod process;
pub mod publisher;
pub mod requests;
pub mod ringbuffer;
pub mod server;
pub mod subscriber;

pub use config::{Cli, Config};
pub use error::{Result, StewardError};
pub use server::Server;
