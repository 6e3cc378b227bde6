//! The embedded message broker.
//!
//! Published messages are handed off through a single shared address held
//! in an embedded `sled` database. Every queued item carries the id of the
//! receiver it is addressed to, and consumers select their own items by that
//! property. Items stay queued until a consumer acknowledges them.
//!
//! The session is not meant to be shared freely: callers serialize access
//! to it behind one lock (see `bus::Router`).

pub mod engine;

pub use engine::{BrokerError, BrokerSession, Consumer, Delivery, DeliveryTag, Producer};
