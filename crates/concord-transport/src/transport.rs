//! Transport abstraction: topics for fan-out, streams for request/response

use crate::error::TransportResult;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Channel depth for stream and topic queues
pub const CHANNEL_CAPACITY: usize = 1024;

/// Network-level peer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A frame received on a topic
#[derive(Debug, Clone)]
pub struct TopicFrame {
    pub from: PeerId,
    pub frame: Bytes,
}

/// Bidirectional frame channel with one peer.
///
/// Dropping `outgoing` closes the stream for the remote side.
pub struct PeerStream {
    pub peer: PeerId,
    pub incoming: mpsc::Receiver<Bytes>,
    pub outgoing: mpsc::Sender<Bytes>,
}

impl PeerStream {
    /// Both ends of an in-process stream pair: `(held by a, held by b)`
    pub fn pair(a: PeerId, b: PeerId) -> (PeerStream, PeerStream) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            PeerStream {
                peer: b,
                incoming: a_rx,
                outgoing: a_tx,
            },
            PeerStream {
                peer: a,
                incoming: b_rx,
                outgoing: b_tx,
            },
        )
    }

    pub async fn send(&self, frame: Bytes) -> TransportResult<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| crate::error::TransportError::Closed(self.peer.to_string()))
    }
}

/// Publish/subscribe plus point-to-point streams
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Best-effort fan-out to every peer subscribed to `topic`
    async fn publish(&self, topic: &str, frame: Bytes) -> TransportResult<()>;

    /// Frames other peers publish on `topic`
    async fn subscribe(&self, topic: &str) -> TransportResult<mpsc::Receiver<TopicFrame>>;

    /// Open a stream to `peer`
    async fn open_stream(&self, peer: &PeerId) -> TransportResult<PeerStream>;

    /// Next stream opened by a remote peer; `None` once the transport shuts down
    async fn accept(&self) -> Option<PeerStream>;

    /// Peers currently reachable
    fn peers(&self) -> Vec<PeerId>;
}
