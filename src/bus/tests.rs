use std::fs;
use std::sync::Arc;

use serde_json::json;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tungstenite::protocol::Message as WsMessage;

use super::{Bus, RouteTable};
use crate::client::Connection;
use crate::message::{Message, MessageJson, codec};
use crate::persistence::{ArchiveLimits, MemoryProbe};
use crate::transport::channel::now_millis;
use crate::transport::{ChannelKind, Frame, RealtimeChannel, RetryPolicy};
use crate::utils::BusError;

struct AmpleMemory;

impl MemoryProbe for AmpleMemory {
    fn available_bytes(&self) -> u64 {
        u64::MAX
    }
}

fn open_bus() -> (Bus, TempDir) {
    let dir = tempdir().unwrap();
    let listeners = Arc::new(RealtimeChannel::new(
        ChannelKind::Message,
        RetryPolicy::default(),
    ));
    let bus = Bus::open(
        dir.path(),
        ArchiveLimits::default(),
        Arc::new(AmpleMemory),
        listeners,
    )
    .unwrap();
    (bus, dir)
}

fn table(entries: &[(&str, &[&str])]) -> RouteTable {
    entries
        .iter()
        .map(|(publisher, receivers)| {
            (
                publisher.to_string(),
                receivers.iter().map(|r| r.to_string()).collect(),
            )
        })
        .collect()
}

fn listener(receiver: &str) -> (Arc<Connection>, UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Connection::new(receiver, tx)), rx)
}

fn pushed_message(rx: &mut UnboundedReceiver<WsMessage>) -> Message {
    match rx.try_recv().unwrap() {
        WsMessage::Binary(bytes) => match Frame::decode(&bytes).unwrap() {
            Frame::Msg(body) => codec::decode(&body).unwrap(),
            other => panic!("expected MSG frame, got {other:?}"),
        },
        other => panic!("expected binary message, got {other:?}"),
    }
}

fn image(publisher: &str, body: &[u8]) -> Message {
    Message::new(publisher, "img", "jpg", body.to_vec())
}

#[test]
fn test_publish_then_poll_receive() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));

    let request: MessageJson = serde_json::from_value(json!({
        "publisher": "cam1",
        "infotype": "img",
        "infoformat": "jpg",
        "contentdata": "/9j/4AAQ"
    }))
    .unwrap();
    let published = bus.publish(request.into_message().unwrap()).unwrap();
    assert!(!published.id.is_empty());
    assert!(published.timestamp > 0);

    let received = bus.receive("disp1").unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, published.id);
    assert_eq!(received[0].content_data, published.content_data);

    assert!(bus.receive("disp1").unwrap().is_empty());
    assert_eq!(bus.published_count("cam1"), 1);
}

#[test]
fn test_publish_fans_out_to_every_receiver() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1", "disp2"]), ("cam2", &["disp2"])]));

    bus.publish(image("cam1", b"a")).unwrap();
    bus.publish(image("cam2", b"b")).unwrap();

    assert_eq!(bus.receive("disp1").unwrap().len(), 1);
    let disp2: Vec<_> = bus
        .receive("disp2")
        .unwrap()
        .into_iter()
        .map(|m| m.publisher)
        .collect();
    assert_eq!(disp2, vec!["cam1", "cam2"]);
    assert!(bus.router().has_consumer("disp2"));
}

#[test]
fn test_ids_are_unique_across_publishes() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    let first = bus.publish(image("cam1", b"1")).unwrap();
    let second = bus.publish(image("cam1", b"2")).unwrap();
    assert_ne!(first.id, second.id);
}

#[test]
fn test_publish_from_unknown_publisher_is_rejected() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    assert!(matches!(
        bus.publish(image("ghost", b"x")),
        Err(BusError::UnknownPublisher(p)) if p == "ghost"
    ));
}

#[test]
fn test_receive_for_unrouted_receiver_is_empty() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    assert!(bus.receive("nobody").unwrap().is_empty());
}

#[test]
fn test_query_requires_route_membership() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    let published = bus.publish(image("cam1", b"archived")).unwrap();

    assert!(matches!(
        bus.query("cam1", "disp2", 0, u64::MAX),
        Err(BusError::NotRouted { .. })
    ));

    let found = bus.query("cam1", "disp1", 0, u64::MAX).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, published.id);

    let before = bus
        .query("cam1", "disp1", 0, published.timestamp - 1)
        .unwrap();
    assert!(before.is_empty());
}

// Archiving is best-effort: a broken archive directory must not stop
// delivery.
#[test]
fn test_archive_failure_still_delivers() {
    let (bus, dir) = open_bus();
    let archive_dir = dir.path().join("messages").join("archive");
    fs::remove_dir_all(&archive_dir).unwrap();
    fs::write(&archive_dir, b"not a directory").unwrap();

    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    let published = bus.publish(image("cam1", b"still delivered")).unwrap();

    let received = bus.receive("disp1").unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, published.id);
    assert!(bus.query("cam1", "disp1", 0, u64::MAX).is_err());
}

#[test]
fn test_route_update_closes_and_recreates_handles() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("p1", &["d1"]), ("p2", &["d2", "d3"])]));
    assert!(bus.router().has_producer("p2"));

    let diff = bus.update_routes(&table(&[("p1", &["d1", "d3"])]));
    assert_eq!(diff.removed_publishers, vec!["p2"]);
    assert_eq!(diff.removed_receivers, vec!["d2"]);
    assert!(diff.added_publishers.is_empty());
    assert!(diff.added_receivers.is_empty());

    let router = bus.router();
    assert!(!router.has_producer("p2"));
    assert!(!router.has_consumer("d2"));
    assert!(router.has_consumer("d3"));
    assert!(router.is_routed("p1", "d3"));
    assert_eq!(router.routes()["p1"], vec!["d1", "d3"]);

    let diff = bus.update_routes(&table(&[("p1", &["d1", "d3"]), ("p3", &["d2"])]));
    assert_eq!(diff.added_publishers, vec!["p3"]);
    assert_eq!(diff.added_receivers, vec!["d2"]);
    assert!(router.has_consumer("d2"));
    assert!(router.has_producer("p3"));
}

#[test]
fn test_publisher_with_empty_route_gets_no_producer() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("idle", &[])]));
    assert!(!bus.router().has_producer("idle"));

    let published = bus.publish(image("idle", b"nowhere")).unwrap();
    assert!(!published.id.is_empty());
}

#[test]
fn test_health_check_replaces_closed_handles() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"]), ("cam2", &["disp2"])]));

    // cam2 stays in the table with no receivers and keeps its producer.
    let diff = bus.update_routes(&table(&[("cam1", &["disp1"]), ("cam2", &[])]));
    assert!(diff.removed_publishers.is_empty());
    assert_eq!(diff.removed_receivers, vec!["disp2"]);

    let router = bus.router();
    assert!(router.has_producer("cam2"));
    assert!(router.close_producer("cam2"));
    assert!(router.close_consumer("disp1"));
    assert!(bus.receive("disp1").is_err());

    router.health_check().unwrap();
    assert!(router.is_alive());
    assert!(!router.has_producer("cam2"));
    assert!(router.has_consumer("disp1"));

    let published = bus.publish(image("cam1", b"after")).unwrap();
    let received = bus.receive("disp1").unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, published.id);
}

#[test]
fn test_health_check_restarts_dead_session() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    bus.publish(image("cam1", b"before")).unwrap();

    bus.router().close();
    assert!(!bus.router().is_alive());

    bus.router().health_check().unwrap();
    assert!(bus.router().is_alive());
    assert!(bus.router().has_producer("cam1"));
    assert!(bus.router().has_consumer("disp1"));

    bus.publish(image("cam1", b"after")).unwrap();
    let bodies: Vec<_> = bus
        .receive("disp1")
        .unwrap()
        .into_iter()
        .map(|m| m.content_data)
        .collect();
    assert_eq!(bodies, vec![b"before".to_vec(), b"after".to_vec()]);
}

#[test]
fn test_unacknowledged_push_falls_back_to_poll() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    let (connection, mut rx) = listener("disp1");
    bus.attach_listener(connection.clone()).unwrap();

    let start = now_millis();
    let published = bus.publish(image("cam1", b"live")).unwrap();
    assert_eq!(pushed_message(&mut rx).id, published.id);

    let channel = bus.listeners();
    for tick in 1..10 {
        let report = channel.sweep_at(start + tick * 21_000);
        assert_eq!(report.resent, 1, "tick {tick}");
        assert_eq!(pushed_message(&mut rx).id, published.id);
    }
    let report = channel.sweep_at(start + 10 * 21_000);
    assert_eq!(report.exhausted, vec!["disp1"]);

    assert!(!channel.registry().contains("disp1"));
    assert_eq!(channel.pending_count(connection.id), 0);

    let polled = bus.receive("disp1").unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].id, published.id);
}

#[test]
fn test_ack_cancels_retry_and_consumes_message() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    let (connection, mut rx) = listener("disp1");
    bus.attach_listener(connection.clone()).unwrap();

    let start = now_millis();
    bus.publish(image("cam1", b"live")).unwrap();
    pushed_message(&mut rx);

    assert_eq!(bus.listeners().sweep_at(start + 21_000).resent, 1);
    pushed_message(&mut rx);

    assert!(bus.acknowledge(&connection).unwrap());
    assert_eq!(bus.listeners().pending_count(connection.id), 0);
    assert_eq!(bus.listeners().sweep_at(start + 42_000).resent, 0);
    assert!(rx.try_recv().is_err());

    assert!(bus.receive("disp1").unwrap().is_empty());
    assert!(!bus.acknowledge(&connection).unwrap());
}

#[test]
fn test_attach_pushes_backlog_once() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    let first = bus.publish(image("cam1", b"1")).unwrap();
    let second = bus.publish(image("cam1", b"2")).unwrap();

    let (connection, mut rx) = listener("disp1");
    assert_eq!(bus.attach_listener(connection.clone()).unwrap(), 2);
    assert_eq!(pushed_message(&mut rx).id, first.id);
    assert_eq!(pushed_message(&mut rx).id, second.id);
    assert!(rx.try_recv().is_err());

    // Closing without acknowledging leaves both for the next poll.
    assert!(bus.detach_listener(&connection));
    assert_eq!(bus.receive("disp1").unwrap().len(), 2);
}

#[test]
fn test_write_failure_detaches_listener() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    let (connection, rx) = listener("disp1");
    bus.attach_listener(connection.clone()).unwrap();
    drop(rx);

    bus.publish(image("cam1", b"lost socket")).unwrap();
    assert!(!bus.listeners().is_live("disp1"));
    assert_eq!(bus.listeners().pending_count(connection.id), 0);
    assert_eq!(bus.receive("disp1").unwrap().len(), 1);
}

#[test]
fn test_speed_is_messages_per_second_since_last_tick() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));

    let start = now_millis();
    bus.compute_speed_at(start);
    for i in 0..4u8 {
        bus.publish(image("cam1", &[i])).unwrap();
    }
    assert_eq!(bus.compute_speed_at(start + 2_000), 2.0);
    assert_eq!(bus.speed(), 2.0);
    assert_eq!(bus.compute_speed_at(start + 3_000), 0.0);
}

#[test]
fn test_close_is_idempotent() {
    let (bus, _dir) = open_bus();
    bus.init_routes(&table(&[("cam1", &["disp1"])]));
    bus.publish(image("cam1", b"x")).unwrap();
    bus.close();
    bus.close();
    assert!(bus.is_closed());
    assert!(!bus.router().is_alive());
}
