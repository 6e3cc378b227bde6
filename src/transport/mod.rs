//! The `transport` module handles the realtime socket side of the bus.
//!
//! It defines the binary frame protocol, the registry of live connections,
//! the acknowledged push channel built on both, and the WebSocket server
//! that accepts workload connections and forwards their frames to the bus.

pub mod channel;
pub mod frame;
pub mod registry;
pub mod websocket;

pub use channel::{ChannelKind, PendingDelivery, RealtimeChannel, RetryPolicy, SweepReport};
pub use frame::{Frame, FrameError, Opcode};
pub use registry::ConnectionRegistry;
pub use websocket::{ServerState, serve, start_websocket_server};
