//! The `client` module represents a workload socket connected to the bus.
//!
//! A [`Connection`] pairs the socket's own identity with the logical
//! workload id it registered under and the channel feeding its writer task.

pub mod pubsub_client;
pub use pubsub_client::{Connection, ConnectionId, SendError};
