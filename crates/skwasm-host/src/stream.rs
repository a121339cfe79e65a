//! Binary stream manager.
//!
//! One-way binary WebSocket fan-out, the fabric radar "spoke" data and
//! similar high-frequency binary telemetry ride on. Clients connect over
//! HTTP (upgraded to a WebSocket by the host's axum router) and are
//! registered against a stream id chosen by the owning plugin; `emit`
//! pushes a binary frame to every client currently attached to that
//! stream, best-effort, dropping any client whose channel is closed or
//! full rather than letting one slow consumer back-pressure the rest.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;

const CLIENT_SEND_QUEUE_CAPACITY: usize = 64;

struct Client {
    id: u64,
    sender: mpsc::Sender<Vec<u8>>,
}

/// All clients currently attached to one stream id.
struct StreamClients {
    clients: Vec<Client>,
}

/// Registry of binary streams for a single plugin, keyed by the stream id
/// the plugin chose when it called the corresponding host import.
pub struct StreamManager {
    plugin_id: String,
    next_client_id: AtomicU64,
    streams: RwLock<HashMap<String, StreamClients>>,
}

impl StreamManager {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            next_client_id: AtomicU64::new(1),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Handle an inbound WebSocket upgrade request for `stream_id`,
    /// registering the resulting connection as a client of that stream.
    pub fn upgrade(self: Arc<Self>, stream_id: String, ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(move |socket| async move {
            self.serve_client(stream_id, socket).await;
        })
    }

    async fn serve_client(&self, stream_id: String, socket: WebSocket) {
        let (mut sink, mut source) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CLIENT_SEND_QUEUE_CAPACITY);
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut streams = self.streams.write().await;
            streams
                .entry(stream_id.clone())
                .or_insert_with(|| StreamClients { clients: Vec::new() })
                .clients
                .push(Client { id: client_id, sender: tx });
        }
        debug!(plugin = %self.plugin_id, stream = %stream_id, client = client_id, "stream client attached");

        let forward = async {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        };
        let drain_inbound = async {
            // This is a one-way stream; inbound frames are drained and
            // discarded so the connection stays alive and ping/pong and
            // close frames are still handled by axum underneath.
            while source.next().await.is_some() {}
        };

        tokio::select! {
            _ = forward => {}
            _ = drain_inbound => {}
        }

        let mut streams = self.streams.write().await;
        if let Some(entry) = streams.get_mut(&stream_id) {
            entry.clients.retain(|c| c.id != client_id);
            if entry.clients.is_empty() {
                streams.remove(&stream_id);
            }
        }
        debug!(plugin = %self.plugin_id, stream = %stream_id, client = client_id, "stream client detached");
    }

    /// Fan a binary frame out to every client currently attached to
    /// `stream_id`. Best-effort: a client whose send queue is full or
    /// whose socket has already closed is dropped from the registry
    /// rather than blocking delivery to the rest.
    pub async fn emit(&self, stream_id: &str, frame: Vec<u8>) {
        let mut streams = self.streams.write().await;
        let Some(entry) = streams.get_mut(stream_id) else {
            return;
        };
        entry.clients.retain(|client| match client.sender.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(plugin = %self.plugin_id, stream = %stream_id, client = client.id, "dropping slow stream client");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if entry.clients.is_empty() {
            streams.remove(stream_id);
        }
    }

    pub async fn client_count(&self, stream_id: &str) -> usize {
        let streams = self.streams.read().await;
        streams.get(stream_id).map(|e| e.clients.len()).unwrap_or(0)
    }

    /// Disconnect every client on every stream, releasing the plugin's
    /// streaming resources when it leaves `running` (§5 single-teardown-step
    /// invariant). Dropping each client's sender closes its forwarding task.
    pub async fn close_all(&self) {
        let mut streams = self.streams.write().await;
        streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_on_unknown_stream_is_a_no_op() {
        let manager = StreamManager::new("test-plugin");
        manager.emit("radar0", vec![1, 2, 3]).await;
        assert_eq!(manager.client_count("radar0").await, 0);
    }

    #[tokio::test]
    async fn close_all_drops_every_client() {
        let manager = StreamManager::new("test-plugin");
        let (tx, rx) = mpsc::channel::<Vec<u8>>(CLIENT_SEND_QUEUE_CAPACITY);
        {
            let mut streams = manager.streams.write().await;
            streams
                .entry("radar0".to_string())
                .or_insert_with(|| StreamClients { clients: Vec::new() })
                .clients
                .push(Client { id: 1, sender: tx });
        }
        manager.close_all().await;
        assert_eq!(manager.client_count("radar0").await, 0);
        drop(rx);
    }

    #[tokio::test]
    async fn registered_client_receives_emitted_frames() {
        let manager = Arc::new(StreamManager::new("test-plugin"));
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CLIENT_SEND_QUEUE_CAPACITY);
        {
            let mut streams = manager.streams.write().await;
            streams
                .entry("radar0".to_string())
                .or_insert_with(|| StreamClients { clients: Vec::new() })
                .clients
                .push(Client { id: 1, sender: tx });
        }

        manager.emit("radar0", vec![9, 9, 9]).await;
        let frame = rx.recv().await.expect("expected a forwarded frame");
        assert_eq!(frame, vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn full_client_queue_is_dropped_without_blocking_others() {
        let manager = Arc::new(StreamManager::new("test-plugin"));
        let (slow_tx, _slow_rx) = mpsc::channel::<Vec<u8>>(1);
        let (fast_tx, mut fast_rx) = mpsc::channel::<Vec<u8>>(CLIENT_SEND_QUEUE_CAPACITY);

        {
            let mut streams = manager.streams.write().await;
            let entry = streams
                .entry("radar0".to_string())
                .or_insert_with(|| StreamClients { clients: Vec::new() });
            entry.clients.push(Client { id: 1, sender: slow_tx.clone() });
            entry.clients.push(Client { id: 2, sender: fast_tx });
        }

        // Fill the slow client's queue so the next emit finds it full.
        slow_tx.try_send(vec![0]).unwrap();
        manager.emit("radar0", vec![1]).await;

        assert_eq!(manager.client_count("radar0").await, 1);
        let frame = fast_rx.recv().await.expect("fast client should still receive");
        assert_eq!(frame, vec![1]);
    }
}
