//! Websocket transport client
//!
//! A single websocket connection to the bastion's connection node carries
//! every channel. The client owns a reconnect loop with capped exponential
//! backoff; outbound frames queue while the link is down and flush once it
//! is re-established. Subscriptions survive reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bolthole_types::AgentMessage;

use crate::{Transport, TransportError, TransportResult, MAX_RECONNECT_WAIT_TIME};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type RouteTable = Arc<DashMap<String, mpsc::UnboundedSender<AgentMessage>>>;

/// Websocket client with automatic reconnect
pub struct WebsocketTransport {
    routes: RouteTable,
    write_tx: mpsc::UnboundedSender<AgentMessage>,
    up: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl WebsocketTransport {
    /// Start the connection loop against a `ws://` / `wss://` URL
    pub fn connect(url: String) -> Self {
        let routes: RouteTable = Arc::new(DashMap::new());
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let up = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(connection_loop(
            url,
            routes.clone(),
            write_rx,
            up.clone(),
            shutdown.clone(),
        ));

        Self {
            routes,
            write_tx,
            up,
            shutdown,
        }
    }

    /// Stop the connection loop and drop the link
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WebsocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn send(&self, message: AgentMessage) -> TransportResult<()> {
        self.write_tx
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self, channel_id: &str) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(channel_id.to_string(), tx);
        rx
    }

    fn unsubscribe(&self, channel_id: &str) {
        self.routes.remove(channel_id);
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

async fn connection_loop(
    url: String,
    routes: RouteTable,
    mut write_rx: mpsc::UnboundedReceiver<AgentMessage>,
    up: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut down_since = tokio::time::Instant::now();

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(%url, "websocket connected");
                up.store(true, Ordering::SeqCst);
                backoff = INITIAL_BACKOFF;

                let (mut sink, mut source) = stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            up.store(false, Ordering::SeqCst);
                            return;
                        }
                        outbound = write_rx.recv() => {
                            let Some(frame) = outbound else {
                                up.store(false, Ordering::SeqCst);
                                return;
                            };
                            let text = match serde_json::to_string(&frame) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!(error = %e, "dropping unserialisable frame");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        inbound = source.next() => {
                            match inbound {
                                Some(Ok(Message::Text(text))) => route(&routes, text.as_bytes()),
                                Some(Ok(Message::Binary(bytes))) => route(&routes, &bytes),
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "websocket read failed");
                                    break;
                                }
                            }
                        }
                    }
                }
                up.store(false, Ordering::SeqCst);
                down_since = tokio::time::Instant::now();
            }
            Err(e) => {
                warn!(%url, error = %e, "websocket connect failed");
            }
        }

        if down_since.elapsed() > MAX_RECONNECT_WAIT_TIME {
            warn!(%url, "giving up on reconnecting");
            return;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn route(routes: &RouteTable, raw: &[u8]) {
    let frame: AgentMessage = match serde_json::from_slice(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "discarding unparseable frame");
            return;
        }
    };

    match routes.get(&frame.channel_id) {
        Some(subscriber) => {
            let _ = subscriber.send(frame);
        }
        None => {
            debug!(channel_id = %frame.channel_id, "no subscriber for inbound frame");
        }
    }
}
