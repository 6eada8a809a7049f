//! Peer transport collaborator: gossip of ledger heads and lease
//! reclamation between nodes.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum PeerTransportError {
    #[error("no subscribers for topic {0:?}")]
    NoSubscribers(String),
}

#[derive(Debug, Clone)]
pub struct PeerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>);
    fn subscribe(&self) -> broadcast::Receiver<PeerMessage>;
}

/// In-process broadcast-channel transport: every node in the same process
/// shares one bus. A real gossip/mesh overlay implements the same trait
/// over an actual network transport.
pub struct InProcessPeerTransport {
    tx: broadcast::Sender<PeerMessage>,
}

impl InProcessPeerTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InProcessPeerTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PeerTransport for InProcessPeerTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) {
        // `send` only errors when there are no receivers; silently
        // dropping is correct for a best-effort gossip bus.
        let _ = self.tx.send(PeerMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_message_reaches_subscriber() {
        let transport = InProcessPeerTransport::new(16);
        let mut rx = transport.subscribe();
        transport.publish("ledger-head", b"abc".to_vec()).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "ledger-head");
        assert_eq!(msg.payload, b"abc");
    }
}
