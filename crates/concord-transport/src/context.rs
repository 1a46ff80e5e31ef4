//! Shared per-node context handed to every handler

use crate::config::NodeConfig;
use crate::error::TransportResult;
use crate::rate_limit::{PeerRateLimiter, RateLimitConfig};
use crate::stats::SyncStats;
use crate::transport::{PeerId, Transport};
use bytes::Bytes;
use concord_core::op::now_millis;
use concord_core::{ActorId, Replica};
use concord_protocol::{encode, Message};
use dashmap::DashMap;
use std::sync::Arc;

/// Everything a node's tasks share: replica, transport, config and counters
pub struct NodeContext {
    pub replica: Arc<Replica>,
    pub transport: Arc<dyn Transport>,
    pub config: NodeConfig,
    pub stats: SyncStats,
    pub limiter: PeerRateLimiter,
    /// Actor keys announced by peers via IDENTITY
    pub peer_actors: DashMap<PeerId, ActorId>,
}

impl NodeContext {
    pub fn new(replica: Arc<Replica>, transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        let limiter = match config.limits.rate_per_sec {
            0 => PeerRateLimiter::disabled(),
            rate => PeerRateLimiter::new(Some(RateLimitConfig::from_rate(
                rate,
                config.limits.burst,
            ))),
        };
        Self {
            replica,
            transport,
            config,
            stats: SyncStats::new(),
            limiter,
            peer_actors: DashMap::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Encode a message stamped with the local wall clock
    pub fn encode(&self, message: &Message) -> TransportResult<Bytes> {
        Ok(encode(message, now_millis())?)
    }
}
