//! Moderation registers
//!
//! Each target actor has one last-writer-wins register holding its current
//! shadow-ban state, and the forum has one governance policy register. Both
//! are ordered by `(lamport, timestamp, admin, ...)` so every replica that
//! trusts the same admins settles on the same value. Moderation never
//! touches the op log; it only decides what a viewer is shown.

use crate::error::{Error, Result};
use crate::hash::{decode_row, encode_row};
use crate::op::{lamport_key, ActorId, OpId, MAX_LAMPORT};
use crate::oplog::ApplyOutcome;
use concord_storage::{Predicate, Row, Storage, Table};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BAN_PREFIX: &str = "ban|";
const POLICY_KEY: &str = "policy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationAction {
    ShadowBan,
    Unban,
}

impl ModerationAction {
    fn priority(&self) -> u8 {
        match self {
            ModerationAction::Unban => 0,
            ModerationAction::ShadowBan => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationAction::ShadowBan => "SHADOW_BAN",
            ModerationAction::Unban => "UNBAN",
        }
    }
}

impl std::fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current moderation state of one actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub target: ActorId,
    pub action: ModerationAction,
    pub admin: ActorId,
    pub lamport: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub reason: String,
}

impl ModerationRecord {
    pub fn new(
        target: ActorId,
        action: ModerationAction,
        admin: ActorId,
        lamport: u64,
        timestamp: i64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            target,
            action,
            admin,
            lamport,
            timestamp,
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(Error::validation("moderation record is missing target"));
        }
        if self.admin.is_empty() {
            return Err(Error::validation("moderation record is missing admin"));
        }
        check_lamport(self.lamport)
    }

    fn merge_cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.admin.cmp(&other.admin))
            .then_with(|| self.action.priority().cmp(&other.action.priority()))
            .then_with(|| self.reason.cmp(&other.reason))
    }

    pub fn wins_over(&self, other: &Self) -> bool {
        self.merge_cmp(other) == Ordering::Greater
    }

    /// Breaks exact `(lamport, timestamp)` ties against content op ids
    fn tie_key(&self) -> String {
        format!("{}|{}|{}", self.admin, self.timestamp, self.action)
    }
}

/// Forum-wide moderation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernancePolicy {
    /// Hide everything a shadow-banned actor ever wrote, not only what came
    /// after the ban
    pub hide_history_on_shadow_ban: bool,
    pub admin: ActorId,
    pub lamport: u64,
    pub timestamp: i64,
}

impl GovernancePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.admin.is_empty() {
            return Err(Error::validation("policy update is missing admin"));
        }
        check_lamport(self.lamport)
    }

    fn merge_cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.admin.cmp(&other.admin))
            .then_with(|| {
                self.hide_history_on_shadow_ban
                    .cmp(&other.hide_history_on_shadow_ban)
            })
    }

    pub fn wins_over(&self, other: &Self) -> bool {
        self.merge_cmp(other) == Ordering::Greater
    }
}

fn check_lamport(lamport: u64) -> Result<()> {
    if lamport == 0 || lamport > MAX_LAMPORT {
        return Err(Error::validation(format!(
            "moderation lamport {} is out of range",
            lamport
        )));
    }
    Ok(())
}

/// Shadow-ban registers, the policy register and the local admin trust list
pub struct ModerationStore {
    storage: Arc<dyn Storage>,
    records: DashMap<ActorId, ModerationRecord>,
    policy: RwLock<Option<GovernancePolicy>>,
    trusted: DashSet<ActorId>,
    writes: Mutex<()>,
}

impl ModerationStore {
    pub async fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let records = DashMap::new();
        for row in storage
            .query(
                Table::Moderation,
                &Predicate::KeyPrefix(BAN_PREFIX.to_string()),
                None,
            )
            .await?
        {
            let record: ModerationRecord = decode_row(&row.value)?;
            records.insert(record.target.clone(), record);
        }

        let policy = match storage.get(Table::Moderation, POLICY_KEY).await? {
            Some(row) => Some(decode_row::<GovernancePolicy>(&row.value)?),
            None => None,
        };

        Ok(Self {
            storage,
            records,
            policy: RwLock::new(policy),
            trusted: DashSet::new(),
            writes: Mutex::new(()),
        })
    }

    /// Accept moderation signed off by `admin`
    pub fn trust(&self, admin: ActorId) {
        self.trusted.insert(admin);
    }

    pub fn is_trusted(&self, admin: &ActorId) -> bool {
        self.trusted.contains(admin)
    }

    /// Merge a record into its target's register
    pub async fn apply(&self, record: ModerationRecord) -> Result<ApplyOutcome> {
        if let Err(e) = record.validate() {
            return Ok(ApplyOutcome::Rejected(e.to_string()));
        }
        if !self.is_trusted(&record.admin) {
            warn!(admin = %record.admin, subject = %record.target, "Ignoring moderation from untrusted admin");
            return Ok(ApplyOutcome::Rejected(format!(
                "admin {} is not trusted",
                record.admin
            )));
        }

        let _guard = self.writes.lock().await;
        let wins = match self.records.get(&record.target) {
            Some(current) => record.wins_over(&current),
            None => true,
        };
        if !wins {
            return Ok(ApplyOutcome::Superseded);
        }

        let key = format!("{}{}", BAN_PREFIX, record.target);
        self.storage
            .put(
                Table::Moderation,
                Row::new(key, lamport_key(record.lamport)?, encode_row(&record)?),
            )
            .await?;
        debug!(
            subject = %record.target,
            action = %record.action,
            lamport = record.lamport,
            "Applied moderation"
        );
        self.records.insert(record.target.clone(), record);
        Ok(ApplyOutcome::Applied)
    }

    /// Merge a policy update into the policy register
    pub async fn apply_policy(&self, policy: GovernancePolicy) -> Result<ApplyOutcome> {
        if let Err(e) = policy.validate() {
            return Ok(ApplyOutcome::Rejected(e.to_string()));
        }
        if !self.is_trusted(&policy.admin) {
            warn!(admin = %policy.admin, "Ignoring policy update from untrusted admin");
            return Ok(ApplyOutcome::Rejected(format!(
                "admin {} is not trusted",
                policy.admin
            )));
        }

        let _guard = self.writes.lock().await;
        let wins = match self.policy.read().as_ref() {
            Some(current) => policy.wins_over(current),
            None => true,
        };
        if !wins {
            return Ok(ApplyOutcome::Superseded);
        }

        self.storage
            .put(
                Table::Moderation,
                Row::new(POLICY_KEY, lamport_key(policy.lamport)?, encode_row(&policy)?),
            )
            .await?;
        debug!(
            hide_history = policy.hide_history_on_shadow_ban,
            lamport = policy.lamport,
            "Applied governance policy"
        );
        *self.policy.write() = Some(policy);
        Ok(ApplyOutcome::Applied)
    }

    pub fn get(&self, target: &ActorId) -> Option<ModerationRecord> {
        self.records.get(target).map(|r| r.value().clone())
    }

    pub fn policy(&self) -> Option<GovernancePolicy> {
        self.policy.read().clone()
    }

    pub fn hides_history(&self) -> bool {
        self.policy
            .read()
            .as_ref()
            .map_or(false, |p| p.hide_history_on_shadow_ban)
    }

    pub fn is_shadow_banned(&self, actor: &ActorId) -> bool {
        self.records
            .get(actor)
            .map_or(false, |r| r.action == ModerationAction::ShadowBan)
    }

    /// Records with `lamport > since`, ascending, never splitting a group of
    /// equal lamports
    pub fn records_since(&self, since: u64, limit: usize) -> Vec<ModerationRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.lamport > since)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.lamport.cmp(&b.lamport).then_with(|| a.target.cmp(&b.target)));

        let mut end = records.len().min(limit);
        if end > 0 {
            let boundary = records[end - 1].lamport;
            while end < records.len() && records[end].lamport == boundary {
                end += 1;
            }
        }
        records.truncate(end);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `viewer` is shown content `author` wrote at
    /// `(lamport, timestamp)`.
    ///
    /// Authors always see their own content. A shadow ban hides what the
    /// author wrote after it; with the hide-history policy it hides
    /// everything.
    pub fn accepts(
        &self,
        author: &ActorId,
        lamport: u64,
        timestamp: i64,
        op_id: &OpId,
        viewer: &ActorId,
    ) -> bool {
        if author == viewer {
            return true;
        }
        let ban = match self.records.get(author) {
            Some(r) if r.action == ModerationAction::ShadowBan => r.value().clone(),
            _ => return true,
        };
        if self.hides_history() {
            return false;
        }

        match lamport
            .cmp(&ban.lamport)
            .then_with(|| timestamp.cmp(&ban.timestamp))
        {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => op_id.as_str() < ban.tie_key().as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::MemoryStorage;

    fn record(target: &str, action: ModerationAction, lamport: u64) -> ModerationRecord {
        ModerationRecord::new(
            ActorId::from(target),
            action,
            ActorId::from("admin"),
            lamport,
            lamport as i64 * 10,
            "spam",
        )
    }

    fn policy(hide: bool, lamport: u64) -> GovernancePolicy {
        GovernancePolicy {
            hide_history_on_shadow_ban: hide,
            admin: ActorId::from("admin"),
            lamport,
            timestamp: lamport as i64 * 10,
        }
    }

    async fn store() -> ModerationStore {
        let store = ModerationStore::open(Arc::new(MemoryStorage::new())).await.unwrap();
        store.trust(ActorId::from("admin"));
        store
    }

    #[tokio::test]
    async fn test_register_converges_in_either_order() {
        let ban = record("mallory", ModerationAction::ShadowBan, 5);
        let unban = record("mallory", ModerationAction::Unban, 9);

        let a = store().await;
        a.apply(ban.clone()).await.unwrap();
        a.apply(unban.clone()).await.unwrap();

        let b = store().await;
        assert!(b.apply(unban.clone()).await.unwrap().is_applied());
        assert_eq!(b.apply(ban).await.unwrap(), ApplyOutcome::Superseded);

        let target = ActorId::from("mallory");
        assert_eq!(a.get(&target), b.get(&target));
        assert!(!b.is_shadow_banned(&target));
    }

    #[tokio::test]
    async fn test_ban_wins_exact_tie() {
        let s = store().await;
        s.apply(record("mallory", ModerationAction::Unban, 5)).await.unwrap();
        assert!(s
            .apply(record("mallory", ModerationAction::ShadowBan, 5))
            .await
            .unwrap()
            .is_applied());
        assert!(s.is_shadow_banned(&ActorId::from("mallory")));
    }

    #[tokio::test]
    async fn test_untrusted_and_invalid_records_are_rejected() {
        let s = store().await;
        let mut forged = record("alice", ModerationAction::ShadowBan, 3);
        forged.admin = ActorId::from("mallory");
        assert!(matches!(s.apply(forged).await.unwrap(), ApplyOutcome::Rejected(_)));

        let unstorable = record("alice", ModerationAction::ShadowBan, u64::MAX);
        assert!(matches!(s.apply(unstorable).await.unwrap(), ApplyOutcome::Rejected(_)));
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn test_ban_hides_only_later_content() {
        let s = store().await;
        s.apply(record("mallory", ModerationAction::ShadowBan, 10)).await.unwrap();
        let author = ActorId::from("mallory");
        let viewer = ActorId::from("alice");
        let op = OpId::from("op");

        assert!(s.accepts(&author, 9, 0, &op, &viewer));
        assert!(!s.accepts(&author, 11, 0, &op, &viewer));
        // Same lamport falls back to the timestamp
        assert!(s.accepts(&author, 10, 99, &op, &viewer));
        assert!(!s.accepts(&author, 10, 101, &op, &viewer));
        // Authors always see their own posts
        assert!(s.accepts(&author, 11, 0, &op, &author));

        s.apply_policy(policy(true, 12)).await.unwrap();
        assert!(!s.accepts(&author, 1, 0, &op, &viewer));
    }

    #[tokio::test]
    async fn test_policy_is_last_writer_wins() {
        let s = store().await;
        assert!(!s.hides_history());
        s.apply_policy(policy(true, 4)).await.unwrap();
        assert_eq!(s.apply_policy(policy(false, 2)).await.unwrap(), ApplyOutcome::Superseded);
        assert!(s.hides_history());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let s = ModerationStore::open(storage.clone()).await.unwrap();
            s.trust(ActorId::from("admin"));
            s.apply(record("mallory", ModerationAction::ShadowBan, 3)).await.unwrap();
            s.apply_policy(policy(true, 4)).await.unwrap();
        }

        let s = ModerationStore::open(storage).await.unwrap();
        assert!(s.is_shadow_banned(&ActorId::from("mallory")));
        assert!(s.hides_history());
    }

    #[tokio::test]
    async fn test_records_since_pages_by_lamport() {
        let s = store().await;
        s.apply(record("a", ModerationAction::ShadowBan, 1)).await.unwrap();
        s.apply(record("b", ModerationAction::ShadowBan, 2)).await.unwrap();
        s.apply(record("c", ModerationAction::Unban, 2)).await.unwrap();
        s.apply(record("d", ModerationAction::ShadowBan, 3)).await.unwrap();

        let page = s.records_since(0, 2);
        let targets: Vec<_> = page.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["a", "b", "c"]);
        assert_eq!(s.records_since(2, 2).len(), 1);
    }
}
