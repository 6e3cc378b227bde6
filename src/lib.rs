//! # EdgeBus
//!
//! `edgebus` is the local message bus of an edge gateway node. Workloads
//! running on the node publish messages to it; the bus stamps and archives
//! every message and delivers it to the receivers routed from the
//! publisher, either on request (poll) or by pushing over a WebSocket with
//! acknowledgment-tracked retry.
//!
//! ## Core Modules
//!
//! - `message`: the `Message` entity, its binary codec, JSON mapping and id generator.
//! - `broker`: the embedded, sled-backed queue that hands messages from publishers to receivers.
//! - `persistence`: the rotating per-publisher on-disk archive.
//! - `bus`: routing table, publish / receive / query, health and speed loops.
//! - `transport`: the frame protocol, connection registry, push channels and WebSocket server.
//! - `client`: a connected workload socket.
//! - `config`: configuration loading.
//! - `utils`: error type and logging setup.

pub mod broker;
pub mod bus;
pub mod client;
pub mod config;
pub mod message;
pub mod persistence;
pub mod transport;
pub mod utils;
