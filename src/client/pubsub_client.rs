use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::{Frame, FrameError};

/// Identity of one socket, distinct from the workload id it registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The socket writer has gone away.
    #[error("connection writer is gone")]
    Disconnected,
}

/// A live workload socket.
///
/// Writes go through an unbounded channel drained by the socket's writer
/// task, so sending never blocks. A failed send means the writer stopped
/// and the connection should be treated as closed.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,

    /// Workload id from the socket path.
    pub logical_id: String,

    sender: UnboundedSender<WsMessage>,
}

impl Connection {
    pub fn new(logical_id: impl Into<String>, sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: ConnectionId::new(),
            logical_id: logical_id.into(),
            sender,
        }
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let bytes = frame.encode()?;
        self.send_bytes(bytes)
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.sender
            .send(WsMessage::binary(bytes))
            .map_err(|_| SendError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
