//! In-process transport pair
//!
//! Two endpoints joined back-to-back, used by tests and by local loopback
//! tooling. Frames sent on one endpoint are routed straight into the
//! peer's subscription table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use bolthole_types::AgentMessage;

use crate::{Transport, TransportError, TransportResult};

type RouteTable = Arc<DashMap<String, mpsc::UnboundedSender<AgentMessage>>>;

/// One endpoint of an in-process transport pair
pub struct MemoryTransport {
    routes: RouteTable,
    peer_routes: RouteTable,
    up: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Create two endpoints joined back-to-back
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let left: RouteTable = Arc::new(DashMap::new());
        let right: RouteTable = Arc::new(DashMap::new());

        (
            MemoryTransport {
                routes: left.clone(),
                peer_routes: right.clone(),
                up: Arc::new(AtomicBool::new(true)),
            },
            MemoryTransport {
                routes: right,
                peer_routes: left,
                up: Arc::new(AtomicBool::new(true)),
            },
        )
    }

    /// Simulate the link going down or coming back (test hook)
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: AgentMessage) -> TransportResult<()> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(TransportError::Down);
        }

        match self.peer_routes.get(&message.channel_id) {
            Some(subscriber) => {
                // A dropped receiver is a closed channel, not a transport
                // fault.
                let _ = subscriber.send(message);
            }
            None => {
                debug!(channel_id = %message.channel_id, "dropping frame for unsubscribed channel");
            }
        }
        Ok(())
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
