//! Prometheus metrics for Concord nodes
//!
//! Counters live in [`SyncStats`](crate::stats::SyncStats) and the replica;
//! this module mirrors them into a registry on every scrape and serves the
//! result in Prometheus text format over HTTP.

use crate::context::NodeContext;
use crate::error::TransportResult;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Concord metrics collector
pub struct Metrics {
    ctx: Arc<NodeContext>,
    registry: Registry,

    /// Sync counters, labelled by event
    pub sync_events: IntCounterVec,

    // Replica gauges
    pub lamport: IntGauge,
    pub entities: IntGauge,
    pub ops: IntGauge,
    pub reports: IntGauge,
    pub unread_notifications: IntGauge,
    pub peers: IntGauge,
    pub last_sync_ms: IntGauge,
}

impl Metrics {
    pub fn new(ctx: Arc<NodeContext>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sync_events = IntCounterVec::new(
            Opts::new("concord_sync_events_total", "Replication events by kind"),
            &["event"],
        )?;
        let lamport = IntGauge::new("concord_lamport", "Current logical clock value")?;
        let entities = IntGauge::new("concord_entities", "Entities known to the replica")?;
        let ops = IntGauge::new("concord_ops", "Ops held in entity histories")?;
        let reports = IntGauge::new("concord_reports", "Moderation reports stored")?;
        let unread_notifications =
            IntGauge::new("concord_unread_notifications", "Unread local notifications")?;
        let peers = IntGauge::new("concord_peers", "Reachable peers")?;
        let last_sync_ms = IntGauge::new(
            "concord_last_sync_timestamp_ms",
            "Wall clock of the last completed sync cycle",
        )?;

        registry.register(Box::new(sync_events.clone()))?;
        registry.register(Box::new(lamport.clone()))?;
        registry.register(Box::new(entities.clone()))?;
        registry.register(Box::new(ops.clone()))?;
        registry.register(Box::new(reports.clone()))?;
        registry.register(Box::new(unread_notifications.clone()))?;
        registry.register(Box::new(peers.clone()))?;
        registry.register(Box::new(last_sync_ms.clone()))?;

        Ok(Self {
            ctx,
            registry,
            sync_events,
            lamport,
            entities,
            ops,
            reports,
            unread_notifications,
            peers,
            last_sync_ms,
        })
    }

    /// Copy current node state into the registry
    pub fn refresh(&self) {
        let stats = self.ctx.stats.snapshot();
        for (event, value) in stats.counters() {
            let counter = self.sync_events.with_label_values(&[event]);
            let seen = counter.get();
            if value > seen {
                counter.inc_by(value - seen);
            }
        }
        self.last_sync_ms.set(stats.last_sync_ms);

        let replica = self.ctx.replica.stats();
        self.lamport.set(replica.lamport as i64);
        self.entities.set(replica.entity_count as i64);
        self.ops.set(replica.op_count as i64);
        self.reports.set(replica.report_count as i64);
        self.unread_notifications.set(replica.unread_notifications as i64);
        self.peers.set(self.ctx.transport.peers().len() as i64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        self.refresh();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve `/metrics` and `/health` until the task is dropped
    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]);
                        let response = respond(&metrics, &request);
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

fn respond(metrics: &Metrics, request: &str) -> String {
    if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
        let body = metrics.export();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK".to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::memory::MemoryNetwork;
    use crate::stats::SyncStats;
    use concord_core::{LocalIdentity, Replica};
    use concord_storage::MemoryStorage;

    #[tokio::test]
    async fn test_export_mirrors_node_state() {
        let replica = Replica::open(
            Arc::new(MemoryStorage::new()),
            Arc::new(LocalIdentity::new("actor-a")),
        )
        .await
        .unwrap();
        replica.create_post("t", "b").await.unwrap();
        let network = MemoryNetwork::new();
        let ctx = Arc::new(NodeContext::new(
            Arc::new(replica),
            network.join("a"),
            NodeConfig::default(),
        ));
        SyncStats::add(&ctx.stats.digests_received, 4);

        let metrics = Metrics::new(ctx.clone()).unwrap();
        let text = metrics.export();
        assert!(text.contains("concord_entities 1"));
        assert!(text.contains("concord_sync_events_total{event=\"digests_received\"} 4"));

        // Scraping twice does not double count
        SyncStats::add(&ctx.stats.digests_received, 1);
        let text = metrics.export();
        assert!(text.contains("concord_sync_events_total{event=\"digests_received\"} 5"));

        assert!(respond(&metrics, "GET /health HTTP/1.1").ends_with("OK"));
        assert!(respond(&metrics, "GET /nope HTTP/1.1").starts_with("HTTP/1.1 404"));
    }
}
