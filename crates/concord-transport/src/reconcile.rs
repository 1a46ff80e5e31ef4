//! Pull-based anti-entropy over digests
//!
//! A cycle walks each peer's digest index in lamport order, one page per
//! request, and merges whatever wins locally. Bodies are fetched from the
//! same peer before the op is applied; a failed fetch is an accepted miss.

use crate::context::NodeContext;
use crate::error::{TransportError, TransportResult};
use crate::stats::SyncStats;
use crate::transport::{PeerId, PeerStream};
use concord_core::op::now_millis;
use concord_core::{ApplyOutcome, ContentId, Digest, GovernancePolicy, ModerationRecord, Op};
use concord_protocol::codec::decode_with_limit;
use concord_protocol::{new_request_id, Message, PostFetchRequest, SyncRequest};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Exchange state with one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    /// Page request sent, waiting for the reply
    Requested,
    /// Reply in hand
    Received,
    /// Merging the page
    Applying,
}

#[derive(Debug, Clone, Default)]
pub struct PeerSyncState {
    pub phase: SyncPhase,
    /// Highest digest lamport seen from this peer
    pub digest_hwm: u64,
    /// Highest favorite-op lamport seen from this peer
    pub favorite_hwm: u64,
    /// Highest moderation-record lamport seen from this peer
    pub moderation_hwm: u64,
    pub last_error: Option<String>,
}

/// What one sync pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pages: usize,
    pub digests: usize,
    pub applied: usize,
    pub favorites_applied: usize,
    pub moderation_applied: usize,
    pub fetched: usize,
    pub fetch_misses: usize,
}

impl SyncReport {
    fn merge(&mut self, other: &SyncReport) {
        self.pages += other.pages;
        self.digests += other.digests;
        self.applied += other.applied;
        self.favorites_applied += other.favorites_applied;
        self.moderation_applied += other.moderation_applied;
        self.fetched += other.fetched;
        self.fetch_misses += other.fetch_misses;
    }
}

/// A request/response session with one peer. The stream is opened on
/// first use.
pub(crate) struct PeerSession<'a> {
    ctx: &'a NodeContext,
    peer: PeerId,
    stream: Option<PeerStream>,
    /// Body fetches left for the current page
    fetch_budget: usize,
}

impl<'a> PeerSession<'a> {
    pub(crate) fn new(ctx: &'a NodeContext, peer: PeerId) -> Self {
        Self {
            ctx,
            peer,
            stream: None,
            fetch_budget: ctx.config.sync.fetch_budget,
        }
    }

    async fn stream(&mut self) -> TransportResult<&mut PeerStream> {
        if self.stream.is_none() {
            let open = self.ctx.transport.open_stream(&self.peer);
            let stream = timeout(self.ctx.config.sync.request_timeout(), open)
                .await
                .map_err(|_| TransportError::Timeout(format!("stream to {}", self.peer)))??;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.peer.to_string()))
    }

    /// Send a request and wait for the reply carrying the same request id.
    /// Unrelated or malformed frames are skipped.
    pub(crate) async fn request(
        &mut self,
        message: Message,
        wait: Duration,
    ) -> TransportResult<Message> {
        let ctx = self.ctx;
        let peer = self.peer.clone();
        let kind = message.kind();
        let request_id = message.request_id().unwrap_or_default().to_string();
        let frame = ctx.encode(&message)?;

        let stream = self.stream().await?;
        stream.send(frame).await?;
        SyncStats::incr(&ctx.stats.requests_sent);

        let deadline = Instant::now() + wait;
        loop {
            let frame = match timeout_at(deadline, stream.incoming.recv()).await {
                Err(_) => return Err(TransportError::Timeout(format!("{} reply from {}", kind, peer))),
                Ok(None) => return Err(TransportError::Closed(peer.to_string())),
                Ok(Some(frame)) => frame,
            };
            match decode_with_limit(&frame, ctx.config.limits.max_frame_bytes) {
                Ok(reply)
                    if reply.kind().is_response()
                        && reply.request_id() == Some(request_id.as_str()) =>
                {
                    return Ok(reply);
                }
                Ok(other) => {
                    debug!(peer = %peer, kind = %other.kind(), "Skipping unrelated frame");
                }
                Err(e) => {
                    SyncStats::incr(&ctx.stats.frames_dropped);
                    warn!(peer = %peer, error = %e, "Dropping malformed reply");
                }
            }
        }
    }

    /// Fetch and verify a body. `Ok(false)` when the peer no longer has it.
    pub(crate) async fn fetch_content(&mut self, content_id: &ContentId) -> TransportResult<bool> {
        SyncStats::incr(&self.ctx.stats.fetch_attempts);
        let request = Message::PostFetchRequest(PostFetchRequest {
            request_id: new_request_id(),
            content_id: content_id.clone(),
        });

        let reply = self
            .request(request, self.ctx.config.sync.fetch_timeout())
            .await?;
        let response = match reply {
            Message::PostFetchResponse(response) => response,
            other => {
                return Err(TransportError::UnexpectedMessage {
                    expected: "POST_FETCH_RESPONSE".into(),
                    got: other.kind().to_string(),
                })
            }
        };

        match response.content_bytes()? {
            Some(bytes) if response.found => {
                self.ctx
                    .replica
                    .content()
                    .put_verified(content_id, &bytes)
                    .await?;
                SyncStats::incr(&self.ctx.stats.fetch_successes);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Merge one page of digests
    pub(crate) async fn apply_digests(
        &mut self,
        digests: Vec<Digest>,
        report: &mut SyncReport,
    ) -> TransportResult<()> {
        self.fetch_budget = self.ctx.config.sync.fetch_budget;
        for digest in digests {
            if let Err(e) = self.apply_digest(digest, report).await {
                // Storage failures abort the page; anything else is per-digest
                if matches!(e, TransportError::Core(concord_core::Error::Persistence(_))) {
                    return Err(e);
                }
                warn!(peer = %self.peer, error = %e, "Skipping digest");
            }
        }
        Ok(())
    }

    async fn apply_digest(&mut self, digest: Digest, report: &mut SyncReport) -> TransportResult<()> {
        let replica = self.ctx.replica.clone();
        let op = digest.to_op();
        op.validate()?;
        replica.clock().observe(digest.lamport).await?;

        let local = replica.log().snapshot(&digest.entity_id);
        let remote_wins = local.as_ref().map_or(true, |s| s.is_beaten_by(&op));
        let same_version = local
            .as_ref()
            .map_or(false, |s| s.current_op_id == digest.op_id);
        if !remote_wins && !same_version {
            return Ok(());
        }

        // Deletes need no body; a known version may still be missing one
        if let (false, Some(content_id)) = (digest.deleted, digest.content_id.as_ref()) {
            if !replica.content().contains(content_id).await? {
                self.fetch_or_miss(content_id, report).await;
            }
        }

        if remote_wins {
            let outcome = replica.ingest_remote(op, None).await?;
            if outcome == ApplyOutcome::Applied {
                report.applied += 1;
                SyncStats::incr(&self.ctx.stats.ops_applied);
            }
        }
        Ok(())
    }

    async fn fetch_or_miss(&mut self, content_id: &ContentId, report: &mut SyncReport) {
        if self.fetch_budget == 0 {
            report.fetch_misses += 1;
            return;
        }
        self.fetch_budget -= 1;

        match self.fetch_content(content_id).await {
            Ok(true) => report.fetched += 1,
            Ok(false) => {
                report.fetch_misses += 1;
                SyncStats::incr(&self.ctx.stats.fetch_failures);
                debug!(peer = %self.peer, content = %content_id, "Peer no longer has content");
            }
            Err(e) => {
                report.fetch_misses += 1;
                SyncStats::incr(&self.ctx.stats.fetch_failures);
                warn!(peer = %self.peer, content = %content_id, error = %e, "Content fetch failed");
            }
        }
    }

    /// Merge a page of favorite ops
    pub(crate) async fn apply_favorite_ops(
        &mut self,
        ops: Vec<Op>,
        report: &mut SyncReport,
    ) -> TransportResult<()> {
        for op in ops {
            if !op.op_type.is_favorite() {
                warn!(peer = %self.peer, op = %op.op_id, "Ignoring non-favorite op in favorite page");
                continue;
            }
            if self.ctx.replica.ingest_remote(op, None).await?.is_applied() {
                report.favorites_applied += 1;
                SyncStats::incr(&self.ctx.stats.ops_applied);
            }
        }
        Ok(())
    }

    /// Merge moderation registers and, when present, the sender's policy.
    /// Records from admins this node does not trust are dropped.
    pub(crate) async fn apply_moderation(
        &mut self,
        records: Vec<ModerationRecord>,
        policy: Option<GovernancePolicy>,
        report: &mut SyncReport,
    ) -> TransportResult<()> {
        let replica = &self.ctx.replica;
        for record in records {
            let target = record.target.clone();
            match replica.ingest_moderation(record).await? {
                ApplyOutcome::Applied => {
                    report.moderation_applied += 1;
                    SyncStats::incr(&self.ctx.stats.moderation_applied);
                }
                ApplyOutcome::Superseded => {}
                ApplyOutcome::Rejected(reason) => {
                    debug!(peer = %self.peer, subject = %target, reason = %reason, "Skipping moderation record");
                }
            }
        }

        if let Some(policy) = policy {
            match replica.ingest_policy(policy).await? {
                ApplyOutcome::Applied => {
                    report.moderation_applied += 1;
                    SyncStats::incr(&self.ctx.stats.moderation_applied);
                }
                ApplyOutcome::Superseded => {}
                ApplyOutcome::Rejected(reason) => {
                    debug!(peer = %self.peer, reason = %reason, "Skipping policy update");
                }
            }
        }
        Ok(())
    }
}

/// Drives periodic reconciliation with every reachable peer
pub struct Reconciler {
    ctx: Arc<NodeContext>,
    peers: DashMap<PeerId, PeerSyncState>,
}

impl Reconciler {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            peers: DashMap::new(),
        }
    }

    pub fn state(&self, peer: &PeerId) -> PeerSyncState {
        self.peers
            .get(peer)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    fn set_phase(&self, peer: &PeerId, phase: SyncPhase) {
        self.peers.entry(peer.clone()).or_default().phase = phase;
    }

    /// One cycle over every peer. A failing peer is skipped until the next cycle.
    pub async fn sync_all(&self) -> SyncReport {
        let mut total = SyncReport::default();
        for peer in self.ctx.transport.peers() {
            match self.sync_peer(&peer).await {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    SyncStats::incr(&self.ctx.stats.peer_failures);
                    warn!(peer = %peer, error = %e, "Sync with peer failed");
                }
            }
        }
        self.ctx.stats.mark_synced(now_millis());
        if total.applied + total.favorites_applied + total.moderation_applied > 0 {
            info!(
                applied = total.applied,
                favorites = total.favorites_applied,
                moderation = total.moderation_applied,
                fetched = total.fetched,
                misses = total.fetch_misses,
                "Sync cycle merged remote ops"
            );
        }
        total
    }

    /// Walk one peer's digests, favorite ops and moderation registers
    pub async fn sync_peer(&self, peer: &PeerId) -> TransportResult<SyncReport> {
        let mut session = PeerSession::new(&self.ctx, peer.clone());
        let mut report = SyncReport::default();

        let result = self.walk(&mut session, peer, &mut report).await;
        let mut state = self.peers.entry(peer.clone()).or_default();
        state.phase = SyncPhase::Idle;
        state.last_error = result.as_ref().err().map(|e| e.to_string());
        drop(state);

        result.map(|_| report)
    }

    async fn walk(
        &self,
        session: &mut PeerSession<'_>,
        peer: &PeerId,
        report: &mut SyncReport,
    ) -> TransportResult<()> {
        let sync = &self.ctx.config.sync;
        let limit = sync.page_size();

        let state = self.state(peer);
        let mut since = state.digest_hwm.saturating_sub(sync.lamport_rewind);
        let mut high = state.digest_hwm;
        loop {
            self.set_phase(peer, SyncPhase::Requested);
            let request = Message::SyncDigestRequest(SyncRequest {
                request_id: new_request_id(),
                since_lamport: since,
                limit,
            });
            let digests = match session.request(request, sync.request_timeout()).await? {
                Message::SyncDigestResponse(response) => response.digests,
                other => {
                    return Err(TransportError::UnexpectedMessage {
                        expected: "SYNC_DIGEST_RESPONSE".into(),
                        got: other.kind().to_string(),
                    })
                }
            };
            self.set_phase(peer, SyncPhase::Received);

            let count = digests.len();
            let last = digests.iter().map(|d| d.lamport).max().unwrap_or(since);
            report.pages += 1;
            report.digests += count;
            SyncStats::add(&self.ctx.stats.digests_received, count as u64);
            debug!(peer = %peer, since, count, "Received digest page");

            self.set_phase(peer, SyncPhase::Applying);
            session.apply_digests(digests, report).await?;

            high = high.max(last);
            self.peers.entry(peer.clone()).or_default().digest_hwm = high;
            // A short page ends the walk; so does a peer that stops advancing
            if count < limit || last <= since {
                break;
            }
            since = last;
        }

        let mut since = state.favorite_hwm.saturating_sub(sync.lamport_rewind);
        let mut high = state.favorite_hwm;
        loop {
            self.set_phase(peer, SyncPhase::Requested);
            let request = Message::FavoriteSyncRequest(SyncRequest {
                request_id: new_request_id(),
                since_lamport: since,
                limit,
            });
            let ops = match session.request(request, sync.request_timeout()).await? {
                Message::FavoriteSyncResponse(response) => response.ops,
                other => {
                    return Err(TransportError::UnexpectedMessage {
                        expected: "FAVORITE_SYNC_RESPONSE".into(),
                        got: other.kind().to_string(),
                    })
                }
            };
            self.set_phase(peer, SyncPhase::Received);

            let count = ops.len();
            let last = ops.iter().map(|op| op.lamport).max().unwrap_or(since);
            report.pages += 1;

            self.set_phase(peer, SyncPhase::Applying);
            session.apply_favorite_ops(ops, report).await?;

            high = high.max(last);
            self.peers.entry(peer.clone()).or_default().favorite_hwm = high;
            if count < limit || last <= since {
                break;
            }
            since = last;
        }

        let mut since = state.moderation_hwm.saturating_sub(sync.lamport_rewind);
        let mut high = state.moderation_hwm;
        loop {
            self.set_phase(peer, SyncPhase::Requested);
            let request = Message::ModerationSyncRequest(SyncRequest {
                request_id: new_request_id(),
                since_lamport: since,
                limit,
            });
            let (records, policy) = match session.request(request, sync.request_timeout()).await? {
                Message::ModerationSyncResponse(response) => (response.records, response.policy),
                other => {
                    return Err(TransportError::UnexpectedMessage {
                        expected: "MODERATION_SYNC_RESPONSE".into(),
                        got: other.kind().to_string(),
                    })
                }
            };
            self.set_phase(peer, SyncPhase::Received);

            let count = records.len();
            let last = records.iter().map(|r| r.lamport).max().unwrap_or(since);
            report.pages += 1;

            self.set_phase(peer, SyncPhase::Applying);
            session.apply_moderation(records, policy, report).await?;

            high = high.max(last);
            self.peers.entry(peer.clone()).or_default().moderation_hwm = high;
            if count < limit || last <= since {
                break;
            }
            since = last;
        }

        Ok(())
    }

    /// Run sync cycles until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.config.sync.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_all().await;
                }
                _ = shutdown.changed() => {
                    debug!("Reconciler stopping");
                    break;
                }
            }
        }
    }
}
