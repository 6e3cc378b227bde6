//! Acknowledged push delivery over live sockets.
//!
//! A `RealtimeChannel` owns the registry of one channel kind (control or
//! message) and the pending pushes of every connection in it. Each push is
//! kept until the client acknowledges it. A periodic sweep resends pushes
//! older than the retry timeout and gives up on a connection once a push
//! has been sent `max_tries` times; giving up unregisters the connection,
//! which for message channels returns the receiver to poll mode.
//!
//! Pending pushes belong to a connection, not to a logical id, so a
//! reconnecting workload starts with a clean slate and the old socket's
//! entries are dropped with it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use super::frame::Frame;
use super::registry::ConnectionRegistry;
use crate::broker::DeliveryTag;
use crate::client::{Connection, ConnectionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Message,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Control => "control",
            ChannelKind::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_timeout: Duration,
    pub max_tries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_secs(20),
            max_tries: 10,
        }
    }
}

/// One push awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub connection_id: ConnectionId,
    /// Encoded frame, resent as-is.
    pub payload: Vec<u8>,
    pub try_count: u32,
    pub last_send_time: i64,
    /// Broker item to acknowledge once the client confirms the push.
    pub tag: Option<DeliveryTag>,
}

#[derive(Debug)]
struct PendingQueue {
    connection: Arc<Connection>,
    deliveries: VecDeque<PendingDelivery>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub resent: usize,
    /// Logical ids whose connection was dropped after exhausting retries.
    pub exhausted: Vec<String>,
}

#[derive(Debug)]
pub struct RealtimeChannel {
    kind: ChannelKind,
    policy: RetryPolicy,
    registry: ConnectionRegistry,
    pending: DashMap<ConnectionId, PendingQueue>,
}

impl RealtimeChannel {
    pub fn new(kind: ChannelKind, policy: RetryPolicy) -> Self {
        Self {
            kind,
            policy,
            registry: ConnectionRegistry::new(),
            pending: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn is_live(&self, logical_id: &str) -> bool {
        self.registry.contains(logical_id)
    }

    pub fn register(&self, connection: Arc<Connection>) {
        if let Some(old) = self.registry.register(connection) {
            self.pending.remove(&old.id);
        }
        self.update_gauge();
    }

    /// Unregister the connection and forget its pending pushes.
    pub fn unregister(&self, logical_id: &str, connection_id: ConnectionId) -> bool {
        self.pending.remove(&connection_id);
        let removed = self.registry.unregister(logical_id, connection_id);
        self.update_gauge();
        removed
    }

    /// Push `frame` to the live connection of `logical_id`.
    ///
    /// Returns `false` when no connection is registered or the write failed;
    /// a failed write unregisters the connection.
    pub fn push(&self, logical_id: &str, frame: &Frame, tag: Option<DeliveryTag>) -> bool {
        match self.registry.get(logical_id) {
            Some(connection) => self.push_to(&connection, frame, tag),
            None => false,
        }
    }

    pub fn push_to(
        &self,
        connection: &Arc<Connection>,
        frame: &Frame,
        tag: Option<DeliveryTag>,
    ) -> bool {
        let payload = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping unencodable {:?} push: {e}", frame.opcode());
                return false;
            }
        };
        if let Err(e) = connection.send_bytes(payload.clone()) {
            warn!(
                "Push to {} on {} channel failed: {e}",
                connection.logical_id,
                self.kind.as_str()
            );
            self.unregister(&connection.logical_id, connection.id);
            return false;
        }

        let delivery = PendingDelivery {
            connection_id: connection.id,
            payload,
            try_count: 1,
            last_send_time: now_millis(),
            tag,
        };
        self.pending
            .entry(connection.id)
            .or_insert_with(|| PendingQueue {
                connection: connection.clone(),
                deliveries: VecDeque::new(),
            })
            .deliveries
            .push_back(delivery);
        true
    }

    /// Push a control signal telling the workload to re-fetch its configuration.
    pub fn signal(&self, logical_id: &str) -> bool {
        self.push(logical_id, &Frame::ControlSignal, None)
    }

    /// Clear the oldest pending push of `connection`.
    pub fn acknowledge(&self, connection: &Connection) -> Option<PendingDelivery> {
        let mut queue = self.pending.get_mut(&connection.id)?;
        let delivery = queue.deliveries.pop_front();
        let drained = queue.deliveries.is_empty();
        drop(queue);
        if drained {
            self.pending
                .remove_if(&connection.id, |_, q| q.deliveries.is_empty());
        }
        delivery
    }

    pub fn pending_count(&self, connection_id: ConnectionId) -> usize {
        self.pending
            .get(&connection_id)
            .map(|q| q.deliveries.len())
            .unwrap_or(0)
    }

    /// One retry pass at wall-clock time `now` (milliseconds).
    pub fn sweep_at(&self, now: i64) -> SweepReport {
        let timeout = self.policy.retry_timeout.as_millis() as i64;
        let mut report = SweepReport::default();
        let mut dead = Vec::new();

        for mut entry in self.pending.iter_mut() {
            let PendingQueue {
                connection,
                deliveries,
            } = entry.value_mut();

            for delivery in deliveries.iter_mut() {
                if now - delivery.last_send_time <= timeout {
                    continue;
                }
                if delivery.try_count >= self.policy.max_tries {
                    dead.push((connection.clone(), true));
                    break;
                }
                if connection.send_bytes(delivery.payload.clone()).is_err() {
                    dead.push((connection.clone(), false));
                    break;
                }
                delivery.try_count += 1;
                delivery.last_send_time = now;
                report.resent += 1;
                counter!("edgebus_push_retries_total", "channel" => self.kind.as_str())
                    .increment(1);
                debug!(
                    "Resent push to {} (try {})",
                    connection.logical_id, delivery.try_count
                );
            }
        }

        for (connection, exhausted) in dead {
            self.unregister(&connection.logical_id, connection.id);
            if exhausted {
                info!(
                    "Giving up on {} after {} tries on {} channel",
                    connection.logical_id,
                    self.policy.max_tries,
                    self.kind.as_str()
                );
                counter!("edgebus_delivery_exhausted_total", "channel" => self.kind.as_str())
                    .increment(1);
                report.exhausted.push(connection.logical_id.clone());
            } else {
                warn!("Connection for {} lost during resend", connection.logical_id);
            }
        }
        report
    }

    /// Sweep every `interval` until the task is dropped.
    pub async fn run_sweep_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let report = self.sweep_at(now_millis());
            if report.resent > 0 || !report.exhausted.is_empty() {
                debug!(
                    "{} channel sweep: {} resent, {} exhausted",
                    self.kind.as_str(),
                    report.resent,
                    report.exhausted.len()
                );
            }
        }
    }

    fn update_gauge(&self) {
        gauge!("edgebus_open_connections", "channel" => self.kind.as_str())
            .set(self.registry.len() as f64);
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
