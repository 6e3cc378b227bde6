//! Broker engine
//!
//! `BrokerSession` owns the sled database backing the shared address and
//! hands out producer and consumer handles. Handles are stamped with the
//! session generation: restarting the session bumps the generation, so
//! every handle created before the restart reports closed and has to be
//! recreated.
//!
//! Keys are `receiver ++ 0x00 ++ sequence` with a big-endian sequence taken
//! from `sled::Db::generate_id`, so a consumer's receiver filter is a prefix
//! scan and items come back in enqueue order.

use std::path::{Path, PathBuf};

use sled::{Db, Tree};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker session is closed")]
    SessionClosed,

    #[error("{kind} for `{id}` is closed")]
    HandleClosed { kind: &'static str, id: String },

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
}

/// Identifies one queued item so it can be acknowledged later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(Vec<u8>);

/// An item taken from a consumer, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Producer {
    publisher: String,
    generation: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct Consumer {
    receiver: String,
    generation: u64,
    closed: bool,
}

struct Store {
    db: Db,
    queue: Tree,
}

pub struct BrokerSession {
    path: PathBuf,
    address: String,
    store: Option<Store>,
    generation: u64,
}

impl BrokerSession {
    /// Address shared by all receivers' traffic.
    pub const DEFAULT_ADDRESS: &'static str = "pubsub.edgebus";

    /// Open (or create) the broker database under `path`.
    pub fn open(path: impl AsRef<Path>, address: &str) -> Result<Self, BrokerError> {
        let path = path.as_ref().to_path_buf();
        let store = Self::open_store(&path, address)?;
        info!("Broker session opened at {}", path.display());
        Ok(Self {
            path,
            address: address.to_string(),
            store: Some(store),
            generation: 0,
        })
    }

    fn open_store(path: &Path, address: &str) -> Result<Store, BrokerError> {
        let db = sled::open(path)?;
        let queue = db.open_tree(address)?;
        Ok(Store { db, queue })
    }

    pub fn is_alive(&self) -> bool {
        self.store.is_some()
    }

    /// Flush and release the database. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.db.flush() {
                debug!("Broker flush on close failed: {e}");
            }
            info!("Broker session closed");
        }
    }

    /// Close and reopen the database. All existing handles become closed.
    pub fn restart(&mut self) -> Result<(), BrokerError> {
        self.close();
        self.generation += 1;
        self.store = Some(Self::open_store(&self.path, &self.address)?);
        info!("Broker session restarted (generation {})", self.generation);
        Ok(())
    }

    fn store(&self) -> Result<&Store, BrokerError> {
        self.store.as_ref().ok_or(BrokerError::SessionClosed)
    }

    pub fn create_producer(&self, publisher: &str) -> Result<Producer, BrokerError> {
        self.store()?;
        Ok(Producer {
            publisher: publisher.to_string(),
            generation: self.generation,
            closed: false,
        })
    }

    pub fn create_consumer(&self, receiver: &str) -> Result<Consumer, BrokerError> {
        self.store()?;
        Ok(Consumer {
            receiver: receiver.to_string(),
            generation: self.generation,
            closed: false,
        })
    }

    pub fn is_producer_closed(&self, producer: &Producer) -> bool {
        producer.closed || producer.generation != self.generation || !self.is_alive()
    }

    pub fn is_consumer_closed(&self, consumer: &Consumer) -> bool {
        consumer.closed || consumer.generation != self.generation || !self.is_alive()
    }

    pub fn close_producer(&self, producer: &mut Producer) {
        producer.closed = true;
    }

    pub fn close_consumer(&self, consumer: &mut Consumer) {
        consumer.closed = true;
    }

    /// Enqueue `payload` on the shared address, tagged with `receiver`.
    pub fn send(
        &self,
        producer: &Producer,
        receiver: &str,
        payload: &[u8],
    ) -> Result<DeliveryTag, BrokerError> {
        if self.is_producer_closed(producer) {
            return Err(BrokerError::HandleClosed {
                kind: "producer",
                id: producer.publisher.clone(),
            });
        }
        let store = self.store()?;
        let mut key = receiver_prefix(receiver);
        key.extend_from_slice(&store.db.generate_id()?.to_be_bytes());
        store.queue.insert(key.as_slice(), payload)?;
        Ok(DeliveryTag(key))
    }

    /// Oldest item addressed to the consumer's receiver, left in the queue.
    pub fn receive(&self, consumer: &Consumer) -> Result<Option<Delivery>, BrokerError> {
        let queue = self.consumer_queue(consumer)?;
        match queue.scan_prefix(receiver_prefix(&consumer.receiver)).next() {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some(Delivery {
                    tag: DeliveryTag(key.to_vec()),
                    payload: value.to_vec(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Every item currently queued for the consumer's receiver, oldest first.
    pub fn browse(&self, consumer: &Consumer) -> Result<Vec<Delivery>, BrokerError> {
        let queue = self.consumer_queue(consumer)?;
        queue
            .scan_prefix(receiver_prefix(&consumer.receiver))
            .map(|entry| {
                let (key, value) = entry?;
                Ok(Delivery {
                    tag: DeliveryTag(key.to_vec()),
                    payload: value.to_vec(),
                })
            })
            .collect()
    }

    /// Remove an item from the queue. Acknowledging twice is a no-op.
    pub fn acknowledge(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.store()?.queue.remove(tag.0.as_slice())?;
        Ok(())
    }

    fn consumer_queue(&self, consumer: &Consumer) -> Result<&Tree, BrokerError> {
        if self.is_consumer_closed(consumer) {
            return Err(BrokerError::HandleClosed {
                kind: "consumer",
                id: consumer.receiver.clone(),
            });
        }
        Ok(&self.store()?.queue)
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("path", &self.path)
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .field("generation", &self.generation)
            .finish()
    }
}

fn receiver_prefix(receiver: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(receiver.len() + 9);
    prefix.extend_from_slice(receiver.as_bytes());
    prefix.push(0);
    prefix
}
