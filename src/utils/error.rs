//! The `error` module defines the crate-wide error type.
//!
//! Component errors (`CodecError`, `FrameError`, `ValidationError`,
//! `BrokerError`) live next to the code that raises them and convert into
//! [`BusError`] at the bus boundary.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::message::{CodecError, ValidationError};
use crate::transport::FrameError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("publisher `{0}` has no route")]
    UnknownPublisher(String),

    #[error("receiver `{receiver}` is not routed from publisher `{publisher}`")]
    NotRouted { publisher: String, receiver: String },
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
