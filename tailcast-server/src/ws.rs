//! Websocket push transport.
//!
//! Architecture:
//! ```text
//!                      ┌──────────── connection task ─────────────┐
//! Client ◄── frames ── │ select! { ws frame in │ outgoing mpsc }  │
//!                      └──────▲───────────────────────────────────┘
//!                             │ ServerMessage
//!        ┌────────────────────┼────────────────────┐
//!   forwarder(D1)        forwarder(D2)   ...   (one per start_streaming)
//!        ▲                    ▲
//!  DeliveryChannel      DeliveryChannel   ◄── Engine::subscribe
//! ```
//!
//! A forwarder sends the backfill, then `streaming_started`, then live lines.
//! The outgoing queue is bounded; a slow socket stalls only its forwarders,
//! whose delivery channels then shed the oldest lines.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use tailcast_core::{DeliveryChannel, DeploymentId, Engine};

use crate::error::ServerError;
use crate::protocol::{ClientMessage, ServerMessage};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Websocket transport statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
}

#[derive(Debug, Default)]
struct AtomicWsStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
}

/// Websocket transport over a shared [`Engine`].
///
/// Cheap to clone; clones share statistics.
#[derive(Clone)]
pub struct WsServer {
    engine: Arc<Engine>,
    outgoing_capacity: usize,
    stats: Arc<AtomicWsStats>,
}

impl WsServer {
    /// `outgoing_capacity` bounds each connection's queue of pending frames.
    pub fn new(engine: Arc<Engine>, outgoing_capacity: usize) -> Self {
        Self {
            engine,
            outgoing_capacity: outgoing_capacity.max(1),
            stats: Arc::new(AtomicWsStats::default()),
        }
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Connection and client message counters.
    pub fn stats(&self) -> WsStats {
        WsStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws_stream.split();

        let client_id = Uuid::new_v4();
        log::info!("WebSocket connection established from {addr} (client {client_id})");
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (out_tx, out_rx) = mpsc::channel(self.outgoing_capacity);
        let mut session = Session {
            client_id,
            engine: self.engine.clone(),
            out_tx,
            streams: HashMap::new(),
        };

        let result = self
            .pump(&mut session, &mut sink, &mut source, out_rx)
            .await;

        session.close().await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Client {client_id} from {addr} disconnected");
        result
    }

    async fn pump(
        &self,
        session: &mut Session,
        sink: &mut WsSink,
        source: &mut WsSource,
        mut out_rx: mpsc::Receiver<ServerMessage>,
    ) -> Result<(), ServerError> {
        send(sink, &ServerMessage::connected(session.client_id)).await?;

        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        if let Some(reply) = session.handle_text(text.as_str()).await {
                            send(sink, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        send(sink, &ServerMessage::error("binary frames are not supported")).await?;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong; push it out now.
                        sink.flush().await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                outgoing = out_rx.recv() => {
                    if let Some(message) = outgoing {
                        send(sink, &message).await?;
                    }
                }
            }
        }
    }
}

/// Per-connection subscriptions. The client id doubles as subscriber id.
struct Session {
    client_id: Uuid,
    engine: Arc<Engine>,
    out_tx: mpsc::Sender<ServerMessage>,
    streams: HashMap<DeploymentId, JoinHandle<()>>,
}

impl Session {
    /// Handle one client frame; returns the direct reply, if any.
    async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Client {} sent an invalid message: {e}", self.client_id);
                return Some(ServerMessage::error(format!("invalid message: {e}")));
            }
        };

        match message {
            ClientMessage::Ping => Some(ServerMessage::pong()),
            ClientMessage::StartStreaming { deployment_id } => self.start(&deployment_id).await,
            ClientMessage::StopStreaming { deployment_id } => self.stop(&deployment_id).await,
        }
    }

    async fn start(&mut self, raw: &str) -> Option<ServerMessage> {
        let deployment = match DeploymentId::parse(raw) {
            Ok(deployment) => deployment,
            Err(e) => return Some(ServerMessage::error(e.to_string())),
        };

        let channel = match self.engine.subscribe(&deployment, self.client_id).await {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("Client {} failed to subscribe to {deployment}: {e}", self.client_id);
                return Some(ServerMessage::error(e.to_string()));
            }
        };
        log::info!("Client {} started streaming deployment {deployment}", self.client_id);

        let forwarder = tokio::spawn(forward(channel, self.out_tx.clone()));
        if let Some(previous) = self.streams.insert(deployment, forwarder) {
            previous.abort();
        }
        None
    }

    async fn stop(&mut self, raw: &str) -> Option<ServerMessage> {
        let deployment = match DeploymentId::parse(raw) {
            Ok(deployment) => deployment,
            Err(e) => return Some(ServerMessage::error(e.to_string())),
        };

        if let Some(forwarder) = self.streams.remove(&deployment) {
            forwarder.abort();
        }
        self.engine.unsubscribe(&deployment, self.client_id).await;
        log::info!("Client {} stopped streaming deployment {deployment}", self.client_id);
        Some(ServerMessage::streaming_stopped(&deployment))
    }

    /// Drop every subscription of this connection.
    async fn close(&mut self) {
        let streams: Vec<(DeploymentId, JoinHandle<()>)> = self.streams.drain().collect();
        for (deployment, forwarder) in streams {
            forwarder.abort();
            self.engine.unsubscribe(&deployment, self.client_id).await;
        }
    }
}

/// Move one subscription's lines into the connection's outgoing queue.
async fn forward(mut channel: DeliveryChannel, out: mpsc::Sender<ServerMessage>) {
    let deployment = channel.deployment_id().clone();

    for _ in 0..channel.pending_backfill() {
        let Some(line) = channel.recv().await else {
            return;
        };
        if out.send(ServerMessage::NewLog(line)).await.is_err() {
            return;
        }
    }
    if out
        .send(ServerMessage::streaming_started(&deployment))
        .await
        .is_err()
    {
        return;
    }

    while let Some(line) = channel.recv().await {
        if out.send(ServerMessage::NewLog(line)).await.is_err() {
            break;
        }
    }
    log::debug!("Forwarder for deployment {deployment} finished");
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> Result<(), ServerError> {
    let text = message.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
