//! Bus engine
//!
//! The `Bus` ties the router, the per-publisher archives and the id
//! generator together:
//! - `publish` stamps a message with an id and timestamp, archives it
//!   best-effort, enqueues it for every routed receiver and pushes it to
//!   receivers with a live message connection
//! - `receive` drains a receiver's queue for poll-mode clients
//! - `query` reads a publisher's archive for a receiver on its route
//!
//! Archive failures never block delivery: they are logged and counted, and
//! the message is still enqueued.
//!
//! A pushed message stays in the broker until the client acknowledges it,
//! so a receiver that falls back to poll mode still finds it on the next
//! `receive`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::route::{RouteDiff, RouteTable};
use super::router::Router;
use crate::client::Connection;
use crate::message::{IdGenerator, Message, codec};
use crate::persistence::{Archive, ArchiveLimits, MemoryProbe};
use crate::transport::channel::now_millis;
use crate::transport::{Frame, RealtimeChannel};
use crate::utils::{BusError, Result};

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    at: i64,
    processed: u64,
}

pub struct Bus {
    router: Router,
    archive_dir: PathBuf,
    limits: ArchiveLimits,
    memory: Arc<dyn MemoryProbe>,
    archives: DashMap<String, Arc<Archive>>,
    ids: IdGenerator,
    listeners: Arc<RealtimeChannel>,
    published: DashMap<String, u64>,
    processed: AtomicU64,
    last_sample: Mutex<SpeedSample>,
    speed: Mutex<f64>,
    closed: AtomicBool,
}

impl Bus {
    /// Open the broker at `<disk>/messages/broker` and the archives under
    /// `<disk>/messages/archive`.
    ///
    /// `listeners` is the message channel used for push delivery.
    pub fn open(
        disk_directory: impl AsRef<Path>,
        limits: ArchiveLimits,
        memory: Arc<dyn MemoryProbe>,
        listeners: Arc<RealtimeChannel>,
    ) -> Result<Self> {
        let messages = disk_directory.as_ref().join("messages");
        let archive_dir = messages.join("archive");
        std::fs::create_dir_all(&archive_dir)?;
        let router = Router::open(messages.join("broker"))?;
        info!("Bus opened at {}", messages.display());

        Ok(Self {
            router,
            archive_dir,
            limits,
            memory,
            archives: DashMap::new(),
            ids: IdGenerator::new(),
            listeners,
            published: DashMap::new(),
            processed: AtomicU64::new(0),
            last_sample: Mutex::new(SpeedSample {
                at: now_millis(),
                processed: 0,
            }),
            speed: Mutex::new(0.0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn listeners(&self) -> &Arc<RealtimeChannel> {
        &self.listeners
    }

    /// Seed the route table at start-up.
    pub fn init_routes(&self, table: &RouteTable) {
        self.router.init(table);
    }

    /// Apply a new route table and drop the archives of publishers that
    /// are no longer routed.
    pub fn update_routes(&self, table: &RouteTable) -> RouteDiff {
        let diff = self.router.update(table);
        for publisher in &diff.removed_publishers {
            if let Some((_, archive)) = self.archives.remove(publisher) {
                if let Err(e) = archive.close() {
                    warn!("Closing archive for {publisher} failed: {e}");
                }
            }
        }
        diff
    }

    /// Assign id and timestamp, archive, and fan out to every receiver.
    pub fn publish(&self, mut message: Message) -> Result<Message> {
        if !self.router.is_known(&message.publisher) {
            return Err(BusError::UnknownPublisher(message.publisher));
        }
        message.id = self.ids.next_id();
        message.timestamp = now_millis() as u64;
        message.version = Message::VERSION;
        let encoded = codec::encode(&message)?;

        *self.published.entry(message.publisher.clone()).or_insert(0) += 1;
        counter!("edgebus_published_total", "publisher" => message.publisher.clone())
            .increment(1);

        let archived = self
            .archive(&message.publisher)
            .and_then(|archive| archive.save(&encoded, message.timestamp));
        if let Err(e) = archived {
            warn!(
                "Archiving message {} from {} failed: {e}",
                message.id, message.publisher
            );
            counter!("edgebus_archive_failures_total").increment(1);
        }

        let deliveries = self.router.enqueue(&message.publisher, &encoded)?;
        if deliveries.iter().any(|(r, _)| self.listeners.is_live(r)) {
            let frame = Frame::Msg(encoded);
            for (receiver, tag) in deliveries {
                if self.listeners.is_live(&receiver) {
                    self.listeners.push(&receiver, &frame, Some(tag));
                }
            }
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        debug!("Published {} from {}", message.id, message.publisher);
        Ok(message)
    }

    /// Drain everything queued for `receiver`. Never blocks.
    pub fn receive(&self, receiver: &str) -> Result<Vec<Message>> {
        let payloads = self.router.drain(receiver)?;
        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match codec::decode(&payload) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Dropping undecodable item for {receiver}: {e}"),
            }
        }
        Ok(messages)
    }

    /// Archived messages of `publisher` in `[from, to]`, for a receiver on
    /// its route.
    pub fn query(
        &self,
        publisher: &str,
        receiver: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<Message>> {
        if !self.router.is_routed(publisher, receiver) {
            return Err(BusError::NotRouted {
                publisher: publisher.to_string(),
                receiver: receiver.to_string(),
            });
        }
        Ok(self.archive(publisher)?.query(from, to)?)
    }

    /// Switch the connection's receiver to push mode and push its backlog.
    /// Returns how many queued messages were pushed.
    pub fn attach_listener(&self, connection: Arc<Connection>) -> Result<usize> {
        self.listeners.register(connection.clone());
        let backlog = self.router.backlog(&connection.logical_id)?;
        let mut pushed = 0;
        for delivery in backlog {
            if !self
                .listeners
                .push_to(&connection, &Frame::Msg(delivery.payload), Some(delivery.tag))
            {
                break;
            }
            pushed += 1;
        }
        if pushed > 0 {
            info!("Pushed {pushed} queued messages to {}", connection.logical_id);
        }
        Ok(pushed)
    }

    /// Return the connection's receiver to poll mode.
    pub fn detach_listener(&self, connection: &Connection) -> bool {
        self.listeners.unregister(&connection.logical_id, connection.id)
    }

    /// Clear the oldest pending push of `connection` and remove the
    /// message from the broker.
    pub fn acknowledge(&self, connection: &Connection) -> Result<bool> {
        match self.listeners.acknowledge(connection) {
            Some(delivery) => {
                if let Some(tag) = delivery.tag {
                    self.router.acknowledge(&tag)?;
                }
                Ok(true)
            }
            None => {
                debug!("Acknowledgment from {} with nothing pending", connection.logical_id);
                Ok(false)
            }
        }
    }

    pub fn published_count(&self, publisher: &str) -> u64 {
        self.published.get(publisher).map(|c| *c).unwrap_or(0)
    }

    /// Messages per second over the last speed interval.
    pub fn speed(&self) -> f64 {
        *self.speed.lock()
    }

    /// Close the speed window at `now` (milliseconds).
    pub fn compute_speed_at(&self, now: i64) -> f64 {
        let processed = self.processed.load(Ordering::Relaxed);
        let mut sample = self.last_sample.lock();
        let elapsed = (now - sample.at) as f64 / 1000.0;
        let speed = if elapsed > 0.0 {
            processed.saturating_sub(sample.processed) as f64 / elapsed
        } else {
            0.0
        };
        *sample = SpeedSample { at: now, processed };
        *self.speed.lock() = speed;
        gauge!("edgebus_publish_speed").set(speed);
        speed
    }

    pub async fn run_speed_loop(self: Arc<Self>, interval: Duration) {
        while !self.is_closed() {
            tokio::time::sleep(interval).await;
            let speed = self.compute_speed_at(now_millis());
            debug!("Publish speed: {speed:.2} msg/s");
        }
    }

    pub async fn run_health_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.router.health_check() {
                error!("Broker health check failed: {e}");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every archive and the broker session.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.archives.iter() {
            if let Err(e) = entry.value().close() {
                warn!("Closing archive for {} failed: {e}", entry.key());
            }
        }
        self.archives.clear();
        self.router.close();
        info!("Bus closed");
    }

    fn archive(&self, publisher: &str) -> std::io::Result<Arc<Archive>> {
        if let Some(archive) = self.archives.get(publisher) {
            return Ok(archive.clone());
        }
        let archive = self
            .archives
            .entry(publisher.to_string())
            .or_try_insert_with(|| {
                Archive::open(&self.archive_dir, publisher, self.limits, self.memory.clone())
                    .map(Arc::new)
            })?;
        Ok(archive.clone())
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("archive_dir", &self.archive_dir)
            .field("archives", &self.archives.len())
            .field("processed", &self.processed.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}
