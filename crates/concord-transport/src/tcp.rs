//! TCP transport
//!
//! Every connection opens with one handshake line, `HELLO <peer_id> <mode>`,
//! where mode is `stream` for a request/response stream or `topic:<name>`
//! for a one-way topic link. Frames after the handshake are newline
//! delimited.

use crate::error::{TransportError, TransportResult};
use crate::transport::{PeerId, PeerStream, TopicFrame, Transport, CHANNEL_CAPACITY};
use async_trait::async_trait;
use bytes::Bytes;
use concord_protocol::FrameDecoder;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const READ_BUFFER: usize = 8192;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HELLO: &str = "HELLO";

/// Purpose of a connection, declared in its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Stream,
    Topic(String),
}

impl Mode {
    fn encode(&self) -> String {
        match self {
            Mode::Stream => "stream".to_string(),
            Mode::Topic(name) => format!("topic:{}", name),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "stream" => Some(Mode::Stream),
            _ => s
                .strip_prefix("topic:")
                .filter(|name| !name.is_empty())
                .map(|name| Mode::Topic(name.to_string())),
        }
    }
}

fn hello_line(local: &PeerId, mode: &Mode) -> String {
    format!("{} {} {}\n", HELLO, local, mode.encode())
}

fn parse_hello(line: &[u8]) -> TransportResult<(PeerId, Mode)> {
    let text = std::str::from_utf8(line)
        .map_err(|_| TransportError::Handshake("handshake is not UTF-8".into()))?;
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(HELLO), Some(peer), Some(mode), None) => {
            let mode = Mode::parse(mode)
                .ok_or_else(|| TransportError::Handshake(format!("unknown mode {}", mode)))?;
            Ok((PeerId::from(peer), mode))
        }
        _ => Err(TransportError::Handshake(format!("bad hello line: {}", text))),
    }
}

type Subscribers = DashMap<String, Vec<mpsc::Sender<TopicFrame>>>;
type Links = DashMap<(PeerId, String), mpsc::Sender<Bytes>>;

/// Peer-to-peer transport over plain TCP connections
pub struct TcpTransport {
    local: PeerId,
    local_addr: SocketAddr,
    max_frame: usize,
    /// Dialable peers, keyed by the id they are known under locally
    peers: DashMap<PeerId, SocketAddr>,
    /// Outgoing topic links, one writer task per (peer, topic)
    links: Arc<Links>,
    subscribers: Arc<Subscribers>,
    accept_tx: mpsc::Sender<PeerStream>,
    accept_rx: Mutex<mpsc::Receiver<PeerStream>>,
}

impl TcpTransport {
    /// Bind `addr` and start accepting connections. The local peer id
    /// defaults to the bound address.
    pub async fn bind(
        addr: SocketAddr,
        peer_id: Option<PeerId>,
        max_frame: usize,
    ) -> TransportResult<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let local = peer_id.unwrap_or_else(|| PeerId::new(local_addr.to_string()));
        let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let transport = Arc::new(Self {
            local,
            local_addr,
            max_frame,
            peers: DashMap::new(),
            links: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
        });
        info!(addr = %local_addr, peer = %transport.local, "TCP transport listening");

        tokio::spawn(Self::accept_loop(
            listener,
            transport.accept_tx.clone(),
            transport.subscribers.clone(),
            max_frame,
        ));
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a dialable peer. Its id is the address.
    pub fn add_peer(&self, addr: SocketAddr) -> PeerId {
        let peer = PeerId::new(addr.to_string());
        self.peers.insert(peer.clone(), addr);
        peer
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.remove(peer);
        self.links.retain(|(p, _), _| p != peer);
    }

    fn address_of(&self, peer: &PeerId) -> TransportResult<SocketAddr> {
        if let Some(addr) = self.peers.get(peer) {
            return Ok(*addr);
        }
        peer.as_str()
            .parse()
            .map_err(|_| TransportError::UnknownPeer(peer.to_string()))
    }

    async fn accept_loop(
        listener: TcpListener,
        accept_tx: mpsc::Sender<PeerStream>,
        subscribers: Arc<Subscribers>,
        max_frame: usize,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let accept_tx = accept_tx.clone();
                    let subscribers = subscribers.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_inbound(stream, accept_tx, subscribers, max_frame).await
                        {
                            warn!(addr = %remote, error = %e, "Rejected inbound connection");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
            if accept_tx.is_closed() {
                break;
            }
        }
    }

    async fn handle_inbound(
        stream: TcpStream,
        accept_tx: mpsc::Sender<PeerStream>,
        subscribers: Arc<Subscribers>,
        max_frame: usize,
    ) -> TransportResult<()> {
        let (mut reader, writer) = stream.into_split();
        let mut decoder = FrameDecoder::with_max_frame(max_frame);

        let hello = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader, &mut decoder))
            .await
            .map_err(|_| TransportError::Timeout("handshake".into()))??;
        let (peer, mode) = parse_hello(&hello)?;
        debug!(peer = %peer, mode = %mode.encode(), "Inbound connection");

        match mode {
            Mode::Stream => {
                let stream = spawn_pumps(peer.clone(), reader, writer, decoder);
                accept_tx
                    .send(stream)
                    .await
                    .map_err(|_| TransportError::Closed(peer.to_string()))?;
            }
            Mode::Topic(topic) => {
                drop(writer);
                let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
                tokio::spawn(read_pump(peer.clone(), reader, decoder, tx));
                while let Some(frame) = rx.recv().await {
                    deliver(&subscribers, &topic, &peer, frame);
                }
                debug!(peer = %peer, topic = %topic, "Topic link closed");
            }
        }
        Ok(())
    }

    async fn dial(&self, peer: &PeerId, mode: &Mode) -> TransportResult<TcpStream> {
        let addr = self.address_of(peer)?;
        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", addr)))??;
        stream.set_nodelay(true)?;
        stream
            .write_all(hello_line(&self.local, mode).as_bytes())
            .await?;
        Ok(stream)
    }

    /// Sender for the (peer, topic) link, dialing it on first use
    fn link(&self, peer: &PeerId, topic: &str) -> mpsc::Sender<Bytes> {
        let key = (peer.clone(), topic.to_string());
        if let Some(tx) = self.links.get(&key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.links.insert(key.clone(), tx.clone());
        tokio::spawn(run_link(
            self.local.clone(),
            key,
            self.address_of(peer).ok(),
            rx,
            self.links.clone(),
        ));
        tx
    }
}

/// Writer task for one topic link. The link is forgotten when the
/// connection fails, so the next publish dials again.
async fn run_link(
    local: PeerId,
    key: (PeerId, String),
    addr: Option<SocketAddr>,
    mut rx: mpsc::Receiver<Bytes>,
    links: Arc<Links>,
) {
    let (peer, topic) = &key;
    let result: TransportResult<()> = async {
        let addr = addr.ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", addr)))??;
        stream.set_nodelay(true)?;
        let mode = Mode::Topic(topic.clone());
        stream.write_all(hello_line(&local, &mode).as_bytes()).await?;

        while let Some(frame) = rx.recv().await {
            stream.write_all(&frame).await?;
            stream.write_all(b"\n").await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!(peer = %peer, topic = %topic, error = %e, "Topic link dropped");
    }
    links.remove(&key);
}

fn deliver(subscribers: &Subscribers, topic: &str, from: &PeerId, frame: Bytes) {
    if let Some(mut subs) = subscribers.get_mut(topic) {
        subs.retain(|tx| !tx.is_closed());
        for tx in subs.iter() {
            let delivery = TopicFrame {
                from: from.clone(),
                frame: frame.clone(),
            };
            if tx.try_send(delivery).is_err() {
                warn!(peer = %from, topic, "Subscriber queue full, frame dropped");
            }
        }
    }
}

/// Read until the decoder yields one frame
async fn read_frame(reader: &mut OwnedReadHalf, decoder: &mut FrameDecoder) -> TransportResult<Bytes> {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(frame);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Closed("connection closed during handshake".into()));
        }
        decoder.feed(&buf[..n]);
    }
}

fn spawn_pumps(
    peer: PeerId,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
) -> PeerStream {
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(read_pump(peer.clone(), reader, decoder, in_tx));
    tokio::spawn(write_pump(peer.clone(), writer, out_rx));
    PeerStream {
        peer,
        incoming: in_rx,
        outgoing: out_tx,
    }
}

async fn read_pump(
    peer: PeerId,
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    tx: mpsc::Sender<Bytes>,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    'conn: loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(peer = %peer, error = %e, "Dropping oversized frame"),
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) => {
                debug!(peer = %peer, error = %e, "Read error");
                break;
            }
        }
    }
}

async fn write_pump(peer: PeerId, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let result = async {
            writer.write_all(&frame).await?;
            writer.write_all(b"\n").await
        }
        .await;
        if let Err(e) = result {
            debug!(peer = %peer, error = %e, "Write error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn publish(&self, topic: &str, frame: Bytes) -> TransportResult<()> {
        for peer in self.peers() {
            let link = self.link(&peer, topic);
            if link.try_send(frame.clone()).is_err() {
                warn!(peer = %peer, topic, "Topic link busy, frame dropped");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<mpsc::Receiver<TopicFrame>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn open_stream(&self, peer: &PeerId) -> TransportResult<PeerStream> {
        let stream = self.dial(peer, &Mode::Stream).await?;
        let (reader, writer) = stream.into_split();
        Ok(spawn_pumps(
            peer.clone(),
            reader,
            writer,
            FrameDecoder::with_max_frame(self.max_frame),
        ))
    }

    async fn accept(&self) -> Option<PeerStream> {
        self.accept_rx.lock().await.recv().await
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.peers.iter().map(|p| p.key().clone()).collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_protocol::MAX_FRAME_SIZE;

    async fn transport(name: &str) -> Arc<TcpTransport> {
        TcpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            Some(PeerId::from(name)),
            MAX_FRAME_SIZE,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_hello_parsing() {
        let (peer, mode) = parse_hello(b"HELLO node-a topic:forum").unwrap();
        assert_eq!(peer, PeerId::from("node-a"));
        assert_eq!(mode, Mode::Topic("forum".into()));

        assert_eq!(parse_hello(b"HELLO b stream").unwrap().1, Mode::Stream);
        assert!(parse_hello(b"HI b stream").is_err());
        assert!(parse_hello(b"HELLO b topic:").is_err());
        assert!(parse_hello(b"HELLO b stream extra").is_err());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let a = transport("a").await;
        let b = transport("b").await;
        let b_id = a.add_peer(b.local_addr());

        let mut to_b = a.open_stream(&b_id).await.unwrap();
        let mut at_b = b.accept().await.unwrap();
        assert_eq!(at_b.peer, PeerId::from("a"));

        to_b.send(Bytes::from_static(b"{\"ping\":1}")).await.unwrap();
        assert_eq!(
            at_b.incoming.recv().await.unwrap(),
            Bytes::from_static(b"{\"ping\":1}")
        );

        at_b.send(Bytes::from_static(b"{\"pong\":1}")).await.unwrap();
        assert_eq!(
            to_b.incoming.recv().await.unwrap(),
            Bytes::from_static(b"{\"pong\":1}")
        );
    }

    #[tokio::test]
    async fn test_topic_publish() {
        let a = transport("a").await;
        let b = transport("b").await;
        a.add_peer(b.local_addr());
        let mut frames = b.subscribe("forum").await.unwrap();

        a.publish("forum", Bytes::from_static(b"first")).await.unwrap();
        a.publish("forum", Bytes::from_static(b"second")).await.unwrap();

        let first = frames.recv().await.unwrap();
        assert_eq!(first.from, PeerId::from("a"));
        assert_eq!(first.frame, Bytes::from_static(b"first"));
        assert_eq!(frames.recv().await.unwrap().frame, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let a = transport("a").await;
        assert!(matches!(
            a.open_stream(&PeerId::from("not-an-address")).await,
            Err(TransportError::UnknownPeer(_))
        ));
    }
}
