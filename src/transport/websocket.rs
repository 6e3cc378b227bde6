//! WebSocket transport
//!
//! Workloads connect on one of two paths:
//! - `/v2/control/socket/id/{id}` for configuration-change signals
//! - `/v2/message/socket/id/{id}` for live message delivery
//!
//! Any other path is refused during the handshake with `404`. Each accepted
//! socket gets a `Connection` whose writer task drains an unbounded channel;
//! the reader loop decodes binary frames and acts on them. A write failure
//! ends the writer task and is handled exactly like a close: the connection
//! is unregistered and, on the message path, its receiver returns to poll
//! mode.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

use super::channel::{ChannelKind, RealtimeChannel};
use super::frame::Frame;
use crate::bus::Bus;
use crate::client::Connection;
use crate::message::codec;

const CONTROL_PREFIX: &str = "/v2/control/socket/id/";
const MESSAGE_PREFIX: &str = "/v2/message/socket/id/";

/// Shared state handed to every connection task.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub bus: Arc<Bus>,
    pub control: Arc<RealtimeChannel>,
}

impl ServerState {
    fn channel(&self, kind: ChannelKind) -> &Arc<RealtimeChannel> {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Message => self.bus.listeners(),
        }
    }
}

/// Map a request path to its channel kind and logical id.
pub fn parse_endpoint(path: &str) -> Option<(ChannelKind, String)> {
    let (kind, id) = if let Some(id) = path.strip_prefix(CONTROL_PREFIX) {
        (ChannelKind::Control, id)
    } else if let Some(id) = path.strip_prefix(MESSAGE_PREFIX) {
        (ChannelKind::Message, id)
    } else {
        return None;
    };
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some((kind, id.to_string()))
}

pub async fn start_websocket_server(addr: &str, state: ServerState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, state).await;
    Ok(())
}

/// Accept connections on `listener` until it fails.
pub async fn serve(listener: TcpListener, state: ServerState) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                spawn(handle_connection(stream, peer, state));
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: ServerState) {
    let mut endpoint = None;
    let route = |request: &Request, response: Response| match parse_endpoint(request.uri().path()) {
        Some(found) => {
            endpoint = Some(found);
            Ok(response)
        }
        None => {
            let mut rejection = ErrorResponse::new(Some("unknown endpoint".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let ws_stream = match accept_hdr_async(stream, route).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };
    let Some((kind, logical_id)) = endpoint else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let connection = Arc::new(Connection::new(logical_id, tx));
    info!(
        "{} connected on {} channel as {}",
        connection.logical_id,
        kind.as_str(),
        connection.id
    );

    match kind {
        ChannelKind::Control => state.control.register(connection.clone()),
        ChannelKind::Message => {
            if let Err(e) = state.bus.attach_listener(connection.clone()) {
                warn!("Backlog push to {} failed: {e}", connection.logical_id);
            }
        }
    }

    let cleanup_called = Arc::new(AtomicBool::new(false));
    // Holds ids only: the writer task must not keep the sender alive.
    let do_cleanup = {
        let channel = state.channel(kind).clone();
        let logical_id = connection.logical_id.clone();
        let connection_id = connection.id;
        let cleanup_called = cleanup_called.clone();
        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                channel.unregister(&logical_id, connection_id);
            }
        }
    };

    {
        let logical_id = connection.logical_id.clone();
        let do_cleanup = do_cleanup.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Write to {logical_id} failed: {e}");
                    break;
                }
            }
            do_cleanup();
            debug!("Send loop closed for {logical_id}");
        });
    }

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Binary(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => handle_frame(frame, kind, &connection, &state),
                Err(e) => warn!("Bad frame from {}: {e}", connection.logical_id),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(other) => debug!(
                "Ignoring non-binary message from {}: {other:?}",
                connection.logical_id
            ),
            Err(e) => {
                debug!("Read from {} failed: {e}", connection.logical_id);
                break;
            }
        }
    }

    do_cleanup();
    info!("{} disconnected from {} channel", connection.logical_id, kind.as_str());
}

fn handle_frame(
    frame: Frame,
    kind: ChannelKind,
    connection: &Arc<Connection>,
    state: &ServerState,
) {
    match frame {
        Frame::Ping => reply(connection, &Frame::Pong),
        // A receipt for a delivered MSG confirms it just like ACK.
        Frame::Ack | Frame::Receipt { .. } => match kind {
            ChannelKind::Message => {
                if let Err(e) = state.bus.acknowledge(connection) {
                    warn!("Acknowledging for {} failed: {e}", connection.logical_id);
                }
            }
            ChannelKind::Control => {
                state.control.acknowledge(connection);
            }
        },
        Frame::Msg(body) if kind == ChannelKind::Message => {
            publish_inbound(&body, connection, state)
        }
        other => debug!(
            "Ignoring {:?} from {} on {} channel",
            other.opcode(),
            connection.logical_id,
            kind.as_str()
        ),
    }
}

/// Publish a message sent by the workload and answer with a receipt.
fn publish_inbound(body: &[u8], connection: &Arc<Connection>, state: &ServerState) {
    let mut message = match codec::decode(body) {
        Ok(message) => message,
        Err(e) => {
            warn!("Undecodable message from {}: {e}", connection.logical_id);
            return;
        }
    };
    message.publisher = connection.logical_id.clone();

    match state.bus.publish(message) {
        Ok(published) => reply(
            connection,
            &Frame::Receipt {
                id: published.id,
                timestamp: published.timestamp,
            },
        ),
        Err(e) => warn!("Publish from {} failed: {e}", connection.logical_id),
    }
}

fn reply(connection: &Arc<Connection>, frame: &Frame) {
    if let Err(e) = connection.send_frame(frame) {
        debug!("Reply to {} dropped: {e}", connection.logical_id);
    }
}
