//! Replica - the context object owning one peer's replicated state

use crate::clock::LogicalClock;
use crate::content::{ContentId, ContentStore, ForumContent};
use crate::entity::EntitySnapshot;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::moderation::{GovernancePolicy, ModerationAction, ModerationRecord, ModerationStore};
use crate::notification::{Notification, NotificationStore};
use crate::op::{now_millis, ActorId, EntityId, Op, OpType};
use crate::oplog::{ApplyOutcome, OperationLog};
use crate::report::{Report, ReportStore, TargetKind};
use concord_storage::Storage;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 10_000;
const NOTIFICATION_PREVIEW_CHARS: usize = 80;

/// State changes published to subscribers
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// An op authored on this replica
    LocalOp(Op),
    /// A report raised on this replica
    LocalReport(Report),
    /// A shadow ban or unban issued by this replica's admin
    LocalModeration(ModerationRecord),
    LocalPolicy(GovernancePolicy),
    /// A peer's op that changed local state
    Merged(Op),
    Notified(Notification),
}

/// One peer's replica: clock, content, op log, reports and notifications
pub struct Replica {
    identity: Arc<dyn Identity>,
    clock: LogicalClock,
    content: ContentStore,
    log: OperationLog,
    reports: ReportStore,
    notifications: NotificationStore,
    moderation: ModerationStore,
    events: broadcast::Sender<ReplicaEvent>,
}

impl Replica {
    /// Open a replica over `storage`, reloading any persisted state
    pub async fn open(storage: Arc<dyn Storage>, identity: Arc<dyn Identity>) -> Result<Self> {
        let clock = LogicalClock::open(storage.clone()).await?;
        let content = ContentStore::new(storage.clone());
        let log = OperationLog::open(storage.clone()).await?;
        let reports = ReportStore::open(storage.clone()).await?;
        let notifications = NotificationStore::open(storage.clone()).await?;
        let moderation = ModerationStore::open(storage).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            actor = %identity.local_actor(),
            lamport = clock.current(),
            entities = log.entity_count(),
            "Opened replica"
        );

        Ok(Self {
            identity,
            clock,
            content,
            log,
            reports,
            notifications,
            moderation,
            events,
        })
    }

    pub fn actor(&self) -> ActorId {
        self.identity.local_actor()
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.notifications
    }

    pub fn moderation(&self) -> &ModerationStore {
        &self.moderation
    }

    /// Subscribe to replica events
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ReplicaEvent) {
        let _ = self.events.send(event);
    }

    /// Author a new post
    pub async fn create_post(&self, title: &str, body: &str) -> Result<Op> {
        if title.trim().is_empty() {
            return Err(Error::validation("post title is empty"));
        }
        self.create(ForumContent::post(title, body), None).await
    }

    /// Reply to a post or comment
    pub async fn comment(&self, parent: &EntityId, body: &str) -> Result<Op> {
        if body.trim().is_empty() {
            return Err(Error::validation("comment body is empty"));
        }
        let parent_snapshot = self.live_snapshot(parent)?;
        self.create(
            ForumContent::comment(body),
            Some(parent_snapshot.entity_id),
        )
        .await
    }

    async fn create(&self, content: ForumContent, parent: Option<EntityId>) -> Result<Op> {
        let payload = content.to_bytes()?;
        let content_id = self.content.put(&payload).await?;
        let actor = self.actor();
        let timestamp = now_millis();
        let entity_id = EntityId::derive(&actor, timestamp, &payload);
        let lamport = self.clock.advance().await?;

        let op = Op::new(entity_id, OpType::Create, actor, lamport, timestamp)
            .with_content(Some(content_id))
            .with_parent(parent);
        self.commit_local(op).await
    }

    /// Tombstone an entity. The delete op keeps the prior content id.
    pub async fn delete(&self, entity_id: &EntityId) -> Result<Op> {
        let snapshot = self.live_snapshot(entity_id)?;
        let lamport = self.clock.advance().await?;

        let op = Op::new(
            entity_id.clone(),
            OpType::Delete,
            self.actor(),
            lamport,
            now_millis(),
        )
        .with_content(snapshot.content_id)
        .with_parent(snapshot.parent_ref);
        self.commit_local(op).await
    }

    pub async fn favorite(&self, entity_id: &EntityId) -> Result<Op> {
        self.set_favorite(entity_id, OpType::Favorite).await
    }

    pub async fn unfavorite(&self, entity_id: &EntityId) -> Result<Op> {
        self.set_favorite(entity_id, OpType::Unfavorite).await
    }

    async fn set_favorite(&self, entity_id: &EntityId, op_type: OpType) -> Result<Op> {
        if self.log.snapshot(entity_id).is_none() {
            return Err(Error::not_found(format!("entity {}", entity_id)));
        }
        let lamport = self.clock.advance().await?;
        let op = Op::new(entity_id.clone(), op_type, self.actor(), lamport, now_millis());
        self.commit_local(op).await
    }

    async fn commit_local(&self, op: Op) -> Result<Op> {
        match self.log.apply(op.clone()).await? {
            ApplyOutcome::Applied => {
                self.emit(ReplicaEvent::LocalOp(op.clone()));
                Ok(op)
            }
            // Same entity, same content, identical submission
            ApplyOutcome::Superseded => Ok(op),
            ApplyOutcome::Rejected(reason) => Err(Error::Validation(reason)),
        }
    }

    /// Report a post or comment to moderators
    pub async fn report(&self, target: &EntityId, reason: &str) -> Result<Report> {
        let snapshot = self
            .log
            .snapshot(target)
            .ok_or_else(|| Error::not_found(format!("entity {}", target)))?;
        let kind = if snapshot.is_comment() {
            TargetKind::Comment
        } else {
            TargetKind::Post
        };

        let report = Report::new(target.clone(), kind, reason, self.actor(), now_millis());
        if self.reports.add(report.clone()).await? {
            self.emit(ReplicaEvent::LocalReport(report.clone()));
        }
        Ok(report)
    }

    /// Hide `target`'s content from everyone but themselves
    pub async fn shadow_ban(&self, target: &ActorId, reason: &str) -> Result<ModerationRecord> {
        self.moderate(target, ModerationAction::ShadowBan, reason).await
    }

    pub async fn unban(&self, target: &ActorId, reason: &str) -> Result<ModerationRecord> {
        self.moderate(target, ModerationAction::Unban, reason).await
    }

    async fn moderate(
        &self,
        target: &ActorId,
        action: ModerationAction,
        reason: &str,
    ) -> Result<ModerationRecord> {
        let admin = self.require_admin()?;
        if target.is_empty() {
            return Err(Error::validation("moderation target is empty"));
        }
        let lamport = self.clock.advance().await?;
        let record = ModerationRecord::new(
            target.clone(),
            action,
            admin,
            lamport,
            now_millis(),
            reason,
        );

        match self.moderation.apply(record.clone()).await? {
            ApplyOutcome::Applied => {
                info!(subject = %target, action = %action, "Issued moderation");
                self.emit(ReplicaEvent::LocalModeration(record.clone()));
                Ok(record)
            }
            ApplyOutcome::Superseded => Ok(record),
            ApplyOutcome::Rejected(reason) => Err(Error::Validation(reason)),
        }
    }

    /// Change whether a shadow ban also hides the target's earlier content
    pub async fn set_governance_policy(&self, hide_history_on_shadow_ban: bool) -> Result<GovernancePolicy> {
        let admin = self.require_admin()?;
        let lamport = self.clock.advance().await?;
        let policy = GovernancePolicy {
            hide_history_on_shadow_ban,
            admin,
            lamport,
            timestamp: now_millis(),
        };

        match self.moderation.apply_policy(policy.clone()).await? {
            ApplyOutcome::Applied => {
                self.emit(ReplicaEvent::LocalPolicy(policy.clone()));
                Ok(policy)
            }
            ApplyOutcome::Superseded => Ok(policy),
            ApplyOutcome::Rejected(reason) => Err(Error::Validation(reason)),
        }
    }

    fn require_admin(&self) -> Result<ActorId> {
        let local = self.actor();
        if !self.moderation.is_trusted(&local) {
            return Err(Error::validation(format!("{} is not a trusted admin", local)));
        }
        Ok(local)
    }

    /// Merge a moderation record received from a peer
    pub async fn ingest_moderation(&self, record: ModerationRecord) -> Result<ApplyOutcome> {
        // Refused records never reach the clock
        if record.validate().is_err() || !self.moderation.is_trusted(&record.admin) {
            return self.moderation.apply(record).await;
        }
        self.clock.observe(record.lamport).await?;
        self.moderation.apply(record).await
    }

    pub async fn ingest_policy(&self, policy: GovernancePolicy) -> Result<ApplyOutcome> {
        if policy.validate().is_err() || !self.moderation.is_trusted(&policy.admin) {
            return self.moderation.apply_policy(policy).await;
        }
        self.clock.observe(policy.lamport).await?;
        self.moderation.apply_policy(policy).await
    }

    /// Whether the local actor is shown this entity
    pub fn is_visible(&self, snapshot: &EntitySnapshot) -> bool {
        !snapshot.deleted
            && self.moderation.accepts(
                &snapshot.actor,
                snapshot.lamport,
                snapshot.timestamp,
                &snapshot.current_op_id,
                &self.actor(),
            )
    }

    /// Live entities the local actor is shown, oldest first
    pub fn feed(&self) -> Vec<EntitySnapshot> {
        let mut visible: Vec<_> = self
            .log
            .snapshots()
            .into_iter()
            .filter(|s| self.is_visible(s))
            .collect();
        visible.sort_by(|a, b| {
            a.lamport
                .cmp(&b.lamport)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        visible
    }

    /// Merge an op received from a peer, with its body when the sender
    /// inlined it. The clock observes the op before it is applied.
    pub async fn ingest_remote(&self, op: Op, content: Option<&[u8]>) -> Result<ApplyOutcome> {
        if let Err(e) = op.validate() {
            warn!(op = %op.op_id, error = %e, "Rejected remote op");
            return Ok(ApplyOutcome::Rejected(e.to_string()));
        }
        if let (Some(bytes), Some(content_id)) = (content, op.content_id.as_ref()) {
            self.content.put_verified(content_id, bytes).await?;
        }

        self.clock.observe(op.lamport).await?;
        let outcome = self.log.apply(op.clone()).await?;

        if outcome.is_applied() {
            debug!(entity = %op.entity_id, op_type = %op.op_type, actor = %op.actor, "Merged remote op");
            if let Err(e) = self.notify_on_reply(&op).await {
                warn!(entity = %op.entity_id, error = %e, "Failed to record notification");
            }
            self.emit(ReplicaEvent::Merged(op));
        }
        Ok(outcome)
    }

    /// Store a report received from a peer
    pub async fn ingest_report(&self, report: Report) -> Result<bool> {
        self.reports.add(report).await
    }

    /// Raise reply notifications for a merged create. Replies can arrive
    /// before the post they answer, so a locally authored post landing from
    /// a peer also picks up the replies already here.
    async fn notify_on_reply(&self, op: &Op) -> Result<()> {
        if op.op_type != OpType::Create {
            return Ok(());
        }
        let local = self.actor();

        if op.actor == local {
            for reply in self.log.children_of(&op.entity_id) {
                if reply.actor != local && self.is_visible(&reply) {
                    self.notify_reply(&reply.entity_id, &reply.actor, reply.content_id.as_ref())
                        .await?;
                }
            }
            return Ok(());
        }

        match op.parent_ref.as_ref().and_then(|p| self.log.snapshot(p)) {
            Some(parent)
                if !parent.deleted
                    && parent.actor == local
                    && self.moderation.accepts(
                        &op.actor,
                        op.lamport,
                        op.timestamp,
                        &op.op_id,
                        &local,
                    ) =>
            {
                self.notify_reply(&op.entity_id, &op.actor, op.content_id.as_ref())
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn notify_reply(
        &self,
        reply_id: &EntityId,
        from: &ActorId,
        content_id: Option<&ContentId>,
    ) -> Result<()> {
        let title = match self.body_of(content_id).await {
            Some(content) => content.preview(NOTIFICATION_PREVIEW_CHARS),
            None => "New reply".to_string(),
        };
        let notification = Notification::reply(
            &self.actor(),
            reply_id.clone(),
            from.clone(),
            title,
            now_millis(),
        );

        if self.notifications.add(notification.clone()).await? {
            debug!(reply = %reply_id, from = %from, "New reply notification");
            self.emit(ReplicaEvent::Notified(notification));
        }
        Ok(())
    }

    async fn body_of(&self, content_id: Option<&ContentId>) -> Option<ForumContent> {
        let bytes = self.content.get(content_id?).await.ok()?;
        ForumContent::from_bytes(&bytes).ok()
    }

    /// Current body of a live entity
    pub async fn read(&self, entity_id: &EntityId) -> Result<ForumContent> {
        let snapshot = self.live_snapshot(entity_id)?;
        let content_id = snapshot
            .content_id
            .ok_or_else(|| Error::not_found(format!("content of {}", entity_id)))?;
        ForumContent::from_bytes(&self.content.get(&content_id).await?)
    }

    fn live_snapshot(&self, entity_id: &EntityId) -> Result<EntitySnapshot> {
        let snapshot = self
            .log
            .snapshot(entity_id)
            .ok_or_else(|| Error::not_found(format!("entity {}", entity_id)))?;
        if snapshot.deleted {
            return Err(Error::validation(format!("entity {} is deleted", entity_id)));
        }
        Ok(snapshot)
    }

    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats {
            lamport: self.clock.current(),
            entity_count: self.log.entity_count(),
            op_count: self.log.op_count(),
            report_count: self.reports.len(),
            unread_notifications: self.notifications.unread_count(),
            subscriber_count: self.events.receiver_count(),
        }
    }
}

/// Replica statistics
#[derive(Debug, Clone)]
pub struct ReplicaStats {
    pub lamport: u64,
    pub entity_count: usize,
    pub op_count: usize,
    pub report_count: usize,
    pub unread_notifications: usize,
    pub subscriber_count: usize,
}
