//! In-process transport for tests and demos

use crate::error::{TransportError, TransportResult};
use crate::transport::{PeerId, PeerStream, TopicFrame, Transport, CHANNEL_CAPACITY};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

struct Slot {
    accept_tx: mpsc::Sender<PeerStream>,
    topics: DashMap<String, Vec<mpsc::Sender<TopicFrame>>>,
}

#[derive(Default)]
struct Inner {
    nodes: DashMap<PeerId, Arc<Slot>>,
    /// Unordered pairs that cannot reach each other
    partitions: DashSet<(PeerId, PeerId)>,
}

impl Inner {
    fn reachable(&self, a: &PeerId, b: &PeerId) -> bool {
        !self.partitions.contains(&ordered(a, b))
    }
}

fn ordered(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// A set of in-process peers that can reach each other
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and return its transport
    pub fn join(&self, peer: impl Into<PeerId>) -> Arc<MemoryTransport> {
        let peer = peer.into();
        let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.inner.nodes.insert(
            peer.clone(),
            Arc::new(Slot {
                accept_tx,
                topics: DashMap::new(),
            }),
        );
        Arc::new(MemoryTransport {
            inner: self.inner.clone(),
            peer,
            accept_rx: Mutex::new(accept_rx),
        })
    }

    /// Cut the link between two peers
    pub fn partition(&self, a: &PeerId, b: &PeerId) {
        self.inner.partitions.insert(ordered(a, b));
    }

    pub fn heal(&self, a: &PeerId, b: &PeerId) {
        self.inner.partitions.remove(&ordered(a, b));
    }
}

/// One peer's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    inner: Arc<Inner>,
    peer: PeerId,
    accept_rx: Mutex<mpsc::Receiver<PeerStream>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    async fn publish(&self, topic: &str, frame: Bytes) -> TransportResult<()> {
        for node in self.inner.nodes.iter() {
            if node.key() == &self.peer || !self.inner.reachable(&self.peer, node.key()) {
                continue;
            }
            if let Some(mut subscribers) = node.value().topics.get_mut(topic) {
                subscribers.retain(|tx| !tx.is_closed());
                for tx in subscribers.iter() {
                    let delivery = TopicFrame {
                        from: self.peer.clone(),
                        frame: frame.clone(),
                    };
                    if tx.try_send(delivery).is_err() {
                        warn!(peer = %node.key(), topic, "Subscriber queue full, frame dropped");
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<mpsc::Receiver<TopicFrame>> {
        let slot = self
            .inner
            .nodes
            .get(&self.peer)
            .map(|s| s.value().clone())
            .ok_or_else(|| TransportError::UnknownPeer(self.peer.to_string()))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        slot.topics.entry(topic.to_string()).or_default().push(tx);
        debug!(peer = %self.peer, topic, "Subscribed");
        Ok(rx)
    }

    async fn open_stream(&self, peer: &PeerId) -> TransportResult<PeerStream> {
        if !self.inner.reachable(&self.peer, peer) {
            return Err(TransportError::Closed(format!("{} is partitioned", peer)));
        }
        let slot = self
            .inner
            .nodes
            .get(peer)
            .map(|s| s.value().clone())
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;

        let (local, remote) = PeerStream::pair(self.peer.clone(), peer.clone());
        slot.accept_tx
            .send(remote)
            .await
            .map_err(|_| TransportError::Closed(peer.to_string()))?;
        Ok(local)
    }

    async fn accept(&self) -> Option<PeerStream> {
        self.accept_rx.lock().await.recv().await
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .inner
            .nodes
            .iter()
            .map(|n| n.key().clone())
            .filter(|p| p != &self.peer && self.inner.reachable(&self.peer, p))
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        let mut b_rx = b.subscribe("forum").await.unwrap();
        let mut a_rx = a.subscribe("forum").await.unwrap();

        a.publish("forum", Bytes::from_static(b"hello")).await.unwrap();

        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.from, PeerId::from("a"));
        assert_eq!(got.frame, Bytes::from_static(b"hello"));
        // No echo to the publisher
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_streams_are_bidirectional() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        let mut to_b = a.open_stream(&PeerId::from("b")).await.unwrap();
        let mut at_b = b.accept().await.unwrap();
        assert_eq!(at_b.peer, PeerId::from("a"));

        to_b.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(at_b.incoming.recv().await.unwrap(), Bytes::from_static(b"ping"));

        at_b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(to_b.incoming.recv().await.unwrap(), Bytes::from_static(b"pong"));

        drop(to_b);
        assert!(at_b.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_partition_blocks_traffic() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let mut b_rx = b.subscribe("forum").await.unwrap();

        network.partition(&PeerId::from("a"), &PeerId::from("b"));
        assert!(a.peers().is_empty());
        assert!(a.open_stream(&PeerId::from("b")).await.is_err());
        a.publish("forum", Bytes::from_static(b"lost")).await.unwrap();
        assert!(b_rx.try_recv().is_err());

        network.heal(&PeerId::from("b"), &PeerId::from("a"));
        assert_eq!(a.peers(), vec![PeerId::from("b")]);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        assert!(matches!(
            a.open_stream(&PeerId::from("ghost")).await,
            Err(TransportError::UnknownPeer(_))
        ));
    }
}
