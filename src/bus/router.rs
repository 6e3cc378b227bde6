//! Router
//!
//! Holds the publisher to receivers table together with the broker handles
//! backing it: one producer per publisher with a non-empty route and one
//! consumer per distinct receiver, however many publishers target it.
//!
//! The broker session is not thread-safe, so every call into it goes
//! through the router's single mutex.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::route::{Route, RouteDiff, RouteTable};
use crate::broker::{BrokerError, BrokerSession, Consumer, Delivery, DeliveryTag, Producer};
use crate::utils::{BusError, Result};

struct RouterInner {
    session: BrokerSession,
    routes: HashMap<String, Route>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

pub struct Router {
    inner: Mutex<RouterInner>,
}

impl Router {
    pub fn new(session: BrokerSession) -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                session,
                routes: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            }),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, BrokerError> {
        Ok(Self::new(BrokerSession::open(
            path,
            BrokerSession::DEFAULT_ADDRESS,
        )?))
    }

    /// Replace the table and create the handles it needs.
    pub fn init(&self, table: &RouteTable) {
        self.inner.lock().init(to_routes(table));
    }

    /// Diff `table` against the current one, closing handles no longer
    /// referenced and creating the new ones. Retained publishers keep their
    /// producer and only get the new receiver list, even when it is empty.
    pub fn update(&self, table: &RouteTable) -> RouteDiff {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let new_routes = to_routes(table);

        let old_publishers = publisher_ids(&inner.routes);
        let old_receivers = receiver_ids(&inner.routes);
        let new_publishers = publisher_ids(&new_routes);
        let new_receivers = receiver_ids(&new_routes);

        let diff = RouteDiff {
            added_publishers: new_publishers.difference(&old_publishers).cloned().collect(),
            removed_publishers: old_publishers.difference(&new_publishers).cloned().collect(),
            added_receivers: new_receivers.difference(&old_receivers).cloned().collect(),
            removed_receivers: old_receivers.difference(&new_receivers).cloned().collect(),
        };

        for publisher in &diff.removed_publishers {
            if let Some(mut producer) = inner.producers.remove(publisher) {
                inner.session.close_producer(&mut producer);
                info!("Closed producer for {publisher}");
            }
        }
        for receiver in &diff.removed_receivers {
            if let Some(mut consumer) = inner.consumers.remove(receiver) {
                inner.session.close_consumer(&mut consumer);
                info!("Closed consumer for {receiver}");
            }
        }

        inner.routes = new_routes;
        inner.ensure_handles();
        if !diff.is_empty() {
            debug!("Route update: {diff:?}");
        }
        diff
    }

    /// Restart a dead broker session, then recreate any handle the broker
    /// reports closed.
    pub fn health_check(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.session.is_alive() {
            warn!("Broker session is down, restarting");
            inner.producers.clear();
            inner.consumers.clear();
            inner.session.restart()?;
            let routes = std::mem::take(&mut inner.routes);
            inner.init(routes);
            return Ok(());
        }

        let closed: Vec<String> = inner
            .producers
            .iter()
            .filter(|(_, p)| inner.session.is_producer_closed(p))
            .map(|(id, _)| id.clone())
            .collect();
        for publisher in closed {
            inner.producers.remove(&publisher);
            let routed = inner.routes.get(&publisher).is_some_and(|r| !r.is_empty());
            if routed {
                info!("Recreating closed producer for {publisher}");
                inner.ensure_producer(&publisher);
            } else {
                info!("Dropping closed producer for {publisher}: no receivers");
            }
        }

        let closed: Vec<String> = inner
            .consumers
            .iter()
            .filter(|(_, c)| inner.session.is_consumer_closed(c))
            .map(|(id, _)| id.clone())
            .collect();
        for receiver in closed {
            inner.consumers.remove(&receiver);
            info!("Recreating closed consumer for {receiver}");
        }

        // Also retries handles whose creation failed earlier.
        inner.ensure_handles();
        Ok(())
    }

    /// Enqueue `payload` once per receiver of `publisher`.
    ///
    /// A producer whose send fails is closed and left for the next health
    /// check to replace.
    pub fn enqueue(
        &self,
        publisher: &str,
        payload: &[u8],
    ) -> Result<Vec<(String, DeliveryTag)>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let route = inner
            .routes
            .get(publisher)
            .ok_or_else(|| BusError::UnknownPublisher(publisher.to_string()))?;
        if route.is_empty() {
            debug!("Publisher {publisher} has no receivers");
            return Ok(Vec::new());
        }
        let Some(producer) = inner.producers.get_mut(publisher) else {
            warn!("No producer for {publisher}; message not enqueued");
            return Ok(Vec::new());
        };

        let mut sent = Vec::with_capacity(route.receivers.len());
        for receiver in &route.receivers {
            match inner.session.send(producer, receiver, payload) {
                Ok(tag) => sent.push((receiver.clone(), tag)),
                Err(e) => {
                    warn!("Enqueue from {publisher} to {receiver} failed: {e}");
                    inner.session.close_producer(producer);
                    break;
                }
            }
        }
        Ok(sent)
    }

    /// Take and acknowledge everything queued for `receiver`.
    ///
    /// On a broker error the consumer is closed, as for `enqueue`.
    pub fn drain(&self, receiver: &str) -> std::result::Result<Vec<Vec<u8>>, BrokerError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(consumer) = inner.consumers.get_mut(receiver) else {
            return Ok(Vec::new());
        };
        let mut payloads = Vec::new();
        loop {
            let taken = inner.session.receive(consumer).and_then(|delivery| {
                if let Some(delivery) = &delivery {
                    inner.session.acknowledge(&delivery.tag)?;
                }
                Ok(delivery)
            });
            match taken {
                Ok(Some(delivery)) => payloads.push(delivery.payload),
                Ok(None) => return Ok(payloads),
                Err(e) => {
                    inner.session.close_consumer(consumer);
                    return Err(e);
                }
            }
        }
    }

    /// Close the producer of `publisher` in place. The next health check
    /// recreates it, or drops it when the route has no receivers.
    pub fn close_producer(&self, publisher: &str) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.producers.get_mut(publisher) {
            Some(producer) => {
                inner.session.close_producer(producer);
                true
            }
            None => false,
        }
    }

    /// Close the consumer of `receiver` in place until the next health check.
    pub fn close_consumer(&self, receiver: &str) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.consumers.get_mut(receiver) {
            Some(consumer) => {
                inner.session.close_consumer(consumer);
                true
            }
            None => false,
        }
    }

    /// Items queued for `receiver`, left in place.
    pub fn backlog(&self, receiver: &str) -> std::result::Result<Vec<Delivery>, BrokerError> {
        let inner = self.inner.lock();
        match inner.consumers.get(receiver) {
            Some(consumer) => inner.session.browse(consumer),
            None => Ok(Vec::new()),
        }
    }

    pub fn acknowledge(&self, tag: &DeliveryTag) -> std::result::Result<(), BrokerError> {
        self.inner.lock().session.acknowledge(tag)
    }

    pub fn is_known(&self, publisher: &str) -> bool {
        self.inner.lock().routes.contains_key(publisher)
    }

    pub fn is_routed(&self, publisher: &str, receiver: &str) -> bool {
        self.inner
            .lock()
            .routes
            .get(publisher)
            .is_some_and(|r| r.contains(receiver))
    }

    pub fn has_producer(&self, publisher: &str) -> bool {
        self.inner.lock().producers.contains_key(publisher)
    }

    pub fn has_consumer(&self, receiver: &str) -> bool {
        self.inner.lock().consumers.contains_key(receiver)
    }

    pub fn routes(&self) -> RouteTable {
        self.inner
            .lock()
            .routes
            .values()
            .map(|r| (r.publisher.clone(), r.receivers.iter().cloned().collect()))
            .collect()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().session.is_alive()
    }

    /// Drop every handle and close the broker session.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.producers.clear();
        inner.consumers.clear();
        inner.session.close();
    }
}

impl RouterInner {
    fn init(&mut self, routes: HashMap<String, Route>) {
        self.routes = routes;
        self.ensure_handles();
        info!(
            "Router initialised: {} producers, {} consumers",
            self.producers.len(),
            self.consumers.len()
        );
    }

    /// Producers are only created for routes with receivers.
    fn ensure_handles(&mut self) {
        let publishers: Vec<String> = self
            .routes
            .values()
            .filter(|r| !r.is_empty())
            .map(|r| r.publisher.clone())
            .collect();
        for publisher in &publishers {
            self.ensure_producer(publisher);
        }
        for receiver in &receiver_ids(&self.routes) {
            self.ensure_consumer(receiver);
        }
    }

    fn ensure_producer(&mut self, publisher: &str) {
        if self.producers.contains_key(publisher) {
            return;
        }
        match self.session.create_producer(publisher) {
            Ok(producer) => {
                self.producers.insert(publisher.to_string(), producer);
            }
            Err(e) => warn!("Could not create producer for {publisher}: {e}"),
        }
    }

    fn ensure_consumer(&mut self, receiver: &str) {
        if self.consumers.contains_key(receiver) {
            return;
        }
        match self.session.create_consumer(receiver) {
            Ok(consumer) => {
                self.consumers.insert(receiver.to_string(), consumer);
            }
            Err(e) => warn!("Could not create consumer for {receiver}: {e}"),
        }
    }
}

fn to_routes(table: &RouteTable) -> HashMap<String, Route> {
    table
        .iter()
        .map(|(publisher, receivers)| (publisher.clone(), Route::new(publisher, receivers)))
        .collect()
}

fn publisher_ids(routes: &HashMap<String, Route>) -> BTreeSet<String> {
    routes.keys().cloned().collect()
}

/// Every receiver named by any route.
fn receiver_ids(routes: &HashMap<String, Route>) -> BTreeSet<String> {
    routes
        .values()
        .flat_map(|r| r.receivers.iter().cloned())
        .collect()
}
