//! Best-effort fan-out of local changes to the forum topic

use crate::context::NodeContext;
use crate::error::TransportResult;
use crate::stats::SyncStats;
use concord_core::{GovernancePolicy, ModerationRecord, Op, Report, ReplicaEvent};
use concord_protocol::{IdentityPayload, Message, OpPayload};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Publishes locally authored ops and reports. No acks, no retry queue:
/// anything a peer misses is picked up by reconciliation.
pub struct Broadcaster {
    ctx: Arc<NodeContext>,
}

impl Broadcaster {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Announce this node's actor key
    pub async fn announce(&self) -> TransportResult<()> {
        let message = Message::Identity(IdentityPayload {
            peer_id: self.ctx.local_peer().to_string(),
            actor: self.ctx.replica.actor(),
        });
        self.send(&message).await
    }

    /// Publish an op, inlining its body when it is held locally
    pub async fn publish(&self, op: &Op) -> TransportResult<()> {
        let message = if op.op_type.is_favorite() {
            Message::FavoriteOp(op.clone())
        } else {
            let content = match op.content_id.as_ref() {
                Some(id) => self.ctx.replica.content().get(id).await.ok(),
                None => None,
            };
            Message::Op(OpPayload::new(op.clone(), content.as_deref()))
        };
        self.send(&message).await
    }

    pub async fn publish_report(&self, report: &Report) -> TransportResult<()> {
        self.send(&Message::Report(report.clone())).await
    }

    pub async fn publish_moderation(&self, record: &ModerationRecord) -> TransportResult<()> {
        self.send(&Message::ModerationOp(record.clone())).await
    }

    pub async fn publish_policy(&self, policy: &GovernancePolicy) -> TransportResult<()> {
        self.send(&Message::GovernancePolicyUpdate(policy.clone()))
            .await
    }

    async fn send(&self, message: &Message) -> TransportResult<()> {
        let frame = self.ctx.encode(message)?;
        let result = self
            .ctx
            .transport
            .publish(&self.ctx.config.topic, frame)
            .await;
        match &result {
            Ok(()) => SyncStats::incr(&self.ctx.stats.broadcasts_sent),
            Err(_) => SyncStats::incr(&self.ctx.stats.broadcast_failures),
        }
        result
    }

    /// Drain the replica's event channel until it closes or `shutdown` flips
    pub async fn run(
        self,
        mut events: broadcast::Receiver<ReplicaEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => break,
            };

            let result = match event {
                Ok(ReplicaEvent::LocalOp(op)) => {
                    debug!(entity = %op.entity_id, op_type = %op.op_type, "Broadcasting op");
                    self.publish(&op).await
                }
                Ok(ReplicaEvent::LocalReport(report)) => self.publish_report(&report).await,
                Ok(ReplicaEvent::LocalModeration(record)) => {
                    debug!(subject = %record.target, action = %record.action, "Broadcasting moderation");
                    self.publish_moderation(&record).await
                }
                Ok(ReplicaEvent::LocalPolicy(policy)) => self.publish_policy(&policy).await,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Skipped ops still reach peers through reconciliation
                    warn!(skipped, "Broadcaster lagged behind replica events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if let Err(e) = result {
                warn!(error = %e, "Broadcast failed");
            }
        }
        debug!("Broadcaster stopping");
    }
}
