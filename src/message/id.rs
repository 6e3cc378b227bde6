//! Message id generation
//!
//! Ids are produced ahead of time by a single dedicated thread into a
//! bounded channel. Publishers block on the channel only when the pool is
//! empty, and there is never more than one producer refilling it.

use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::warn;
use uuid::Uuid;

/// Pool of pre-generated, unique message ids.
#[derive(Debug)]
pub struct IdGenerator {
    ids: Receiver<String>,
}

impl IdGenerator {
    /// Number of ids kept ready by the refill thread.
    pub const POOL_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self::with_pool_size(Self::POOL_SIZE)
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        let (tx, rx) = bounded(pool_size.max(1));
        if let Err(e) = thread::Builder::new()
            .name("id-refill".into())
            .spawn(move || refill(tx))
        {
            // The sender was moved into the failed closure and dropped, so
            // `next_id` falls back to generating inline.
            warn!("Failed to start id refill thread: {e}");
        }
        Self { ids: rx }
    }

    /// Take the next id from the pool, blocking while it is being refilled.
    pub fn next_id(&self) -> String {
        self.ids.recv().unwrap_or_else(|_| generate())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn refill(tx: Sender<String>) {
    // Ends once the generator, and with it the receiver, is dropped.
    while tx.send(generate()).is_ok() {}
}

fn generate() -> String {
    Uuid::new_v4().simple().to_string()
}
