//! Concord Daemon (concordd)
//!
//! Runs one forum replica and keeps it in sync with its peers.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (TCP on 7420, in-memory replica)
//! concordd
//!
//! # Persistent replica with two peers
//! concordd --db /var/lib/concord/replica.db --peer 10.0.0.2:7420 --peer 10.0.0.3:7420
//!
//! # With configuration file
//! concordd --config /etc/concord/concord.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use concord_core::{LocalIdentity, Replica};
use concord_storage::{MemoryStorage, SqliteStorage, Storage};
use concord_transport::{
    LimitsConfig, Node, NodeConfig, PeerId, SyncConfig, TcpTransport, DEFAULT_TOPIC,
};

const DEFAULT_LISTEN: &str = "0.0.0.0:7420";

/// Concord Daemon - peer-to-peer forum replica
#[derive(Parser, Debug, Default)]
#[command(name = "concordd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CONCORD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept peer connections on
    #[arg(long, env = "CONCORD_LISTEN")]
    listen: Option<String>,

    /// Peer address to sync with (repeatable)
    #[arg(long = "peer", env = "CONCORD_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Network id announced to peers (default: the listen address)
    #[arg(long, env = "CONCORD_PEER_ID")]
    peer_id: Option<String>,

    /// Local actor key used to author ops
    #[arg(long, env = "CONCORD_ACTOR")]
    actor: Option<String>,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "CONCORD_DB")]
    db: Option<PathBuf>,

    /// Admin actor whose moderation records are honored (repeatable)
    #[arg(long = "trusted-admin", env = "CONCORD_TRUSTED_ADMINS", value_delimiter = ',')]
    trusted_admins: Vec<String>,

    /// Pub/sub topic for forum ops
    #[arg(long, env = "CONCORD_TOPIC")]
    topic: Option<String>,

    /// Seconds between reconciliation cycles
    #[arg(long, env = "CONCORD_SYNC_INTERVAL")]
    sync_interval: Option<u64>,

    /// Rate limit: max frames per second per peer (0 = disabled)
    #[arg(long, env = "CONCORD_RATE_LIMIT")]
    rate_limit: Option<u32>,

    /// Rate limit burst size (default: 2x rate limit)
    #[arg(long, env = "CONCORD_RATE_BURST")]
    rate_burst: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONCORD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "CONCORD_METRICS_PORT")]
    metrics_port: Option<u16>,
}

/// Contents of the `--config` file
#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    peers: Vec<String>,
    peer_id: Option<String>,
    actor: Option<String>,
    db: Option<PathBuf>,
    topic: Option<String>,
    trusted_admins: Vec<String>,
    log_level: Option<String>,
    metrics_port: Option<u16>,
    sync: SyncConfig,
    limits: LimitsConfig,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Effective settings: flags over file over defaults
#[derive(Debug)]
struct Settings {
    listen: SocketAddr,
    peers: Vec<SocketAddr>,
    peer_id: Option<String>,
    actor: Option<String>,
    db: Option<PathBuf>,
    log_level: String,
    metrics_port: Option<u16>,
    node: NodeConfig,
}

impl Settings {
    fn resolve(args: Args, file: FileConfig) -> Result<Self> {
        let listen = args
            .listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen
            .parse()
            .with_context(|| format!("invalid listen address {}", listen))?;

        let peers = if args.peers.is_empty() {
            file.peers
        } else {
            args.peers
        };
        let peers = peers
            .iter()
            .map(|p| {
                p.parse()
                    .with_context(|| format!("invalid peer address {}", p))
            })
            .collect::<Result<Vec<SocketAddr>>>()?;

        let mut sync = file.sync;
        if let Some(secs) = args.sync_interval {
            sync.interval_secs = secs;
        }
        let mut limits = file.limits;
        if let Some(rate) = args.rate_limit {
            limits.rate_per_sec = rate;
        }
        if args.rate_burst.is_some() {
            limits.burst = args.rate_burst;
        }
        let trusted_admins = if args.trusted_admins.is_empty() {
            file.trusted_admins
        } else {
            args.trusted_admins
        };

        Ok(Self {
            listen,
            peers,
            peer_id: args.peer_id.or(file.peer_id),
            actor: args.actor.or(file.actor),
            db: args.db.or(file.db),
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            metrics_port: args.metrics_port.or(file.metrics_port),
            node: NodeConfig {
                topic: args
                    .topic
                    .or(file.topic)
                    .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                sync,
                limits,
                trusted_admins,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(args, file)?;

    // Initialize logging; RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let storage: Arc<dyn Storage> = match &settings.db {
        Some(db_path) => {
            info!(path = %db_path.display(), "Initializing SQLite persistence");
            let storage = SqliteStorage::new(db_path)
                .with_context(|| format!("opening {}", db_path.display()))?;
            Arc::new(storage)
        }
        None => {
            info!("Running in-memory only (no --db specified)");
            Arc::new(MemoryStorage::new())
        }
    };

    let transport = TcpTransport::bind(
        settings.listen,
        settings.peer_id.clone().map(PeerId::from),
        settings.node.limits.max_frame_bytes,
    )
    .await
    .with_context(|| format!("binding {}", settings.listen))?;
    for addr in &settings.peers {
        let peer = transport.add_peer(*addr);
        info!(peer = %peer, "Added peer");
    }

    let actor = match &settings.actor {
        Some(actor) => actor.clone(),
        None => {
            warn!("No actor configured, using the peer id");
            transport.local_addr().to_string()
        }
    };
    let replica = Replica::open(storage, Arc::new(LocalIdentity::new(actor))).await?;

    info!(
        listen = %settings.listen,
        peers = settings.peers.len(),
        topic = %settings.node.topic,
        sync_interval = settings.node.sync.interval_secs,
        rate_limit = settings.node.limits.rate_per_sec,
        trusted_admins = settings.node.trusted_admins.len(),
        "Starting Concord daemon"
    );

    let node = Node::new(Arc::new(replica), transport, settings.node);
    let handle = node.start().await?;

    if let Some(port) = settings.metrics_port {
        start_metrics(&node, port)?;
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.shutdown().await;

    Ok(())
}

#[cfg(feature = "metrics")]
fn start_metrics(node: &Node, port: u16) -> Result<()> {
    use concord_transport::{Metrics, MetricsServer};

    let metrics = Metrics::new(node.context().clone())
        .map_err(|e| anyhow::anyhow!("creating metrics registry: {}", e))?;
    let metrics = Arc::new(metrics);
    let server = MetricsServer::new(metrics, SocketAddr::from(([0, 0, 0, 0], port)));
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "Metrics server error");
        }
    });
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn start_metrics(_node: &Node, port: u16) -> Result<()> {
    warn!(port, "Built without the metrics feature, not serving metrics");
    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╔═╗╔═╗╔╗╔╔═╗╔═╗╦═╗╔╦╗
  ║  ║ ║║║║║  ║ ║╠╦╝ ║║
  ╚═╝╚═╝╝╚╝╚═╝╚═╝╩╚══╩╝
  Decentralized forum replica
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(Args::default(), FileConfig::default()).unwrap();
        assert_eq!(settings.listen, DEFAULT_LISTEN.parse().unwrap());
        assert!(settings.peers.is_empty());
        assert_eq!(settings.node.topic, DEFAULT_TOPIC);
        assert_eq!(settings.node.sync.interval_secs, 12);
        assert_eq!(settings.log_level, "info");
        assert!(settings.node.trusted_admins.is_empty());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen = "127.0.0.1:9000"
peers = ["127.0.0.1:9001"]
topic = "staging"
trusted_admins = ["actor-admin"]

[sync]
interval_secs = 30
batch_size = 50

[limits]
rate_per_sec = 100
"#
        )
        .unwrap();
        let config = FileConfig::load(file.path()).unwrap();

        let args = Args {
            listen: Some("127.0.0.1:9100".into()),
            sync_interval: Some(5),
            ..Args::default()
        };
        let settings = Settings::resolve(args, config).unwrap();

        assert_eq!(settings.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(settings.peers, vec!["127.0.0.1:9001".parse().unwrap()]);
        assert_eq!(settings.node.topic, "staging");
        assert_eq!(settings.node.trusted_admins, vec!["actor-admin".to_string()]);
        assert_eq!(settings.node.sync.interval_secs, 5);
        assert_eq!(settings.node.sync.batch_size, 50);
        // Untouched keys keep their defaults
        assert_eq!(settings.node.sync.fetch_budget, 16);
        assert_eq!(settings.node.limits.rate_per_sec, 100);
    }

    #[test]
    fn test_rejects_bad_input() {
        let args = Args {
            peers: vec!["not an address".into()],
            ..Args::default()
        };
        assert!(Settings::resolve(args, FileConfig::default()).is_err());

        let parsed: Result<FileConfig, _> = toml::from_str("unknown_key = 1");
        assert!(parsed.is_err());
    }
}
