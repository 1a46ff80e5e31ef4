//! A running replica attached to a transport

use crate::broadcaster::Broadcaster;
use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::dispatcher::Dispatcher;
use crate::error::TransportResult;
use crate::reconcile::{Reconciler, SyncReport};
use crate::transport::Transport;
use concord_core::{ActorId, Replica};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wires a replica to a transport: inbound dispatch, local-op broadcast
/// and periodic reconciliation
pub struct Node {
    ctx: Arc<NodeContext>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
}

impl Node {
    pub fn new(replica: Arc<Replica>, transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        for admin in &config.trusted_admins {
            replica.moderation().trust(ActorId::new(admin.as_str()));
        }
        let ctx = Arc::new(NodeContext::new(replica, transport, config));
        Self {
            dispatcher: Arc::new(Dispatcher::new(ctx.clone())),
            reconciler: Arc::new(Reconciler::new(ctx.clone())),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.ctx.replica
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Run one reconciliation cycle against every reachable peer
    pub async fn sync_now(&self) -> SyncReport {
        self.reconciler.sync_all().await
    }

    /// Spawn the node's tasks. Periodic sync is skipped when
    /// `sync.interval_secs` is 0.
    pub async fn start(&self) -> TransportResult<NodeHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let frames = self.ctx.transport.subscribe(&self.ctx.config.topic).await?;
        tasks.push(tokio::spawn(self.dispatcher.clone().serve_topic(frames)));

        let dispatcher = self.dispatcher.clone();
        let transport = self.ctx.transport.clone();
        let mut stop = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = transport.accept() => match stream {
                        Some(stream) => {
                            tokio::spawn(dispatcher.clone().serve_stream(stream));
                        }
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));

        let broadcaster = Broadcaster::new(self.ctx.clone());
        if let Err(e) = broadcaster.announce().await {
            warn!(error = %e, "Failed to announce identity");
        }
        let events = self.ctx.replica.subscribe();
        tasks.push(tokio::spawn(broadcaster.run(events, shutdown_rx.clone())));

        if self.ctx.config.sync.interval_secs > 0 {
            tasks.push(tokio::spawn(self.reconciler.clone().run(shutdown_rx)));
        }

        info!(
            peer = %self.ctx.local_peer(),
            actor = %self.ctx.replica.actor(),
            topic = %self.ctx.config.topic,
            rate_limited = self.ctx.limiter.is_enabled(),
            "Node started"
        );
        Ok(NodeHandle { shutdown_tx, tasks })
    }
}

/// Handle to a started node's tasks
pub struct NodeHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Stop every task and wait for them to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Node stopped");
    }
}
