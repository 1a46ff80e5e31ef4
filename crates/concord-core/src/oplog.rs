//! Operation log and deterministic merge

use crate::digest::{Digest, DigestIndex};
use crate::entity::EntitySnapshot;
use crate::error::Result;
use crate::hash::{decode_row, encode_row};
use crate::op::{lamport_key, ActorId, EntityId, Op, OpId, OpType};
use concord_storage::{Batch, Predicate, Row, Storage, Table};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of merging one op
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Durable state, snapshot and history were updated
    Applied,
    /// Already known, or lost the tie-break against the current op
    Superseded,
    /// Structurally invalid; nothing was written
    Rejected(String),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// `(actor, entity)` key of a favorite register
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FavoriteKey {
    actor: ActorId,
    entity_id: EntityId,
}

impl FavoriteKey {
    fn of(op: &Op) -> Self {
        Self {
            actor: op.actor.clone(),
            entity_id: op.entity_id.clone(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}|{}", self.actor, self.entity_id)
    }
}

/// Append-only per-entity history with merge-by-total-order.
///
/// Writers to one entity are serialized by a per-entity async mutex; the
/// snapshot, favorite and digest maps are read without it.
pub struct OperationLog {
    storage: Arc<dyn Storage>,
    snapshots: DashMap<EntityId, EntitySnapshot>,
    histories: DashMap<EntityId, Vec<Op>>,
    applied: DashSet<OpId>,
    favorites: DashMap<FavoriteKey, Op>,
    digests: DigestIndex,
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl OperationLog {
    /// Load persisted ops, snapshots and favorite registers
    pub async fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let log = Self {
            storage,
            snapshots: DashMap::new(),
            histories: DashMap::new(),
            applied: DashSet::new(),
            favorites: DashMap::new(),
            digests: DigestIndex::new(),
            locks: DashMap::new(),
        };

        for row in log.storage.query(Table::Entities, &Predicate::All, None).await? {
            let snapshot: EntitySnapshot = decode_row(&row.value)?;
            log.snapshots.insert(snapshot.entity_id.clone(), snapshot);
        }

        for row in log.storage.query(Table::Favorites, &Predicate::All, None).await? {
            let op: Op = decode_row(&row.value)?;
            log.favorites.insert(FavoriteKey::of(&op), op);
        }

        let ops = log.storage.query(Table::Ops, &Predicate::All, None).await?;
        let op_count = ops.len();
        for row in ops {
            let op: Op = decode_row(&row.value)?;
            log.applied.insert(op.op_id.clone());
            if !op.op_type.is_favorite() {
                log.histories.entry(op.entity_id.clone()).or_default().push(op);
            }
        }

        // Digests come from the winning op so deletes keep their content id
        for snapshot in log.snapshots.iter() {
            let digest = log
                .histories
                .get(snapshot.key())
                .and_then(|ops| {
                    ops.iter()
                        .find(|op| op.op_id == snapshot.current_op_id)
                        .map(Digest::from)
                })
                .unwrap_or_else(|| Digest::from(snapshot.value()));
            log.digests.upsert(digest);
        }

        info!(
            entities = log.snapshots.len(),
            ops = op_count,
            "Loaded operation log"
        );

        Ok(log)
    }

    /// Merge one op.
    ///
    /// Returns `Err` only when the storage write fails, in which case no
    /// in-memory state has changed.
    pub async fn apply(&self, op: Op) -> Result<ApplyOutcome> {
        if let Err(e) = op.validate() {
            warn!(op = %op.op_id, error = %e, "Rejected op");
            return Ok(ApplyOutcome::Rejected(e.to_string()));
        }

        let lock = self.entity_lock(&op.entity_id);
        let _guard = lock.lock().await;

        if self.applied.contains(&op.op_id) {
            return Ok(ApplyOutcome::Superseded);
        }

        if op.op_type.is_favorite() {
            self.apply_favorite(op).await
        } else {
            self.apply_entity_op(op).await
        }
    }

    async fn apply_entity_op(&self, op: Op) -> Result<ApplyOutcome> {
        let wins = match self.snapshots.get(&op.entity_id) {
            Some(current) => current.is_beaten_by(&op),
            None => true,
        };
        if !wins {
            debug!(entity = %op.entity_id, op = %op.op_id, "Op superseded");
            return Ok(ApplyOutcome::Superseded);
        }

        let snapshot = EntitySnapshot::from_op(&op);
        let order = lamport_key(op.lamport)?;
        let batch = Batch::new()
            .put(
                Table::Ops,
                Row::new(op.op_id.as_str(), order, encode_row(&op)?),
            )
            .put(
                Table::Entities,
                Row::new(op.entity_id.as_str(), order, encode_row(&snapshot)?),
            );
        self.storage.apply(batch).await?;

        // Committed; publish without yielding
        self.digests.upsert(Digest::from(&op));
        self.snapshots.insert(op.entity_id.clone(), snapshot);
        self.applied.insert(op.op_id.clone());
        debug!(
            entity = %op.entity_id,
            op_type = %op.op_type,
            lamport = op.lamport,
            "Applied op"
        );
        self.histories.entry(op.entity_id.clone()).or_default().push(op);

        Ok(ApplyOutcome::Applied)
    }

    async fn apply_favorite(&self, op: Op) -> Result<ApplyOutcome> {
        let key = FavoriteKey::of(&op);
        let wins = match self.favorites.get(&key) {
            Some(current) => op.wins_over(&current),
            None => true,
        };
        if !wins {
            return Ok(ApplyOutcome::Superseded);
        }

        let encoded = encode_row(&op)?;
        let order = lamport_key(op.lamport)?;
        let batch = Batch::new()
            .put(
                Table::Ops,
                Row::new(op.op_id.as_str(), order, encoded.clone()),
            )
            .put(
                Table::Favorites,
                Row::new(key.storage_key(), order, encoded),
            );
        self.storage.apply(batch).await?;

        self.applied.insert(op.op_id.clone());
        debug!(
            entity = %op.entity_id,
            actor = %op.actor,
            op_type = %op.op_type,
            "Applied favorite op"
        );
        self.favorites.insert(key, op);

        Ok(ApplyOutcome::Applied)
    }

    fn entity_lock(&self, entity_id: &EntityId) -> Arc<Mutex<()>> {
        self.locks
            .entry(entity_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    pub fn snapshot(&self, entity_id: &EntityId) -> Option<EntitySnapshot> {
        self.snapshots.get(entity_id).map(|s| s.value().clone())
    }

    /// Applied create/delete ops for an entity, in application order
    pub fn history(&self, entity_id: &EntityId) -> Vec<Op> {
        self.histories
            .get(entity_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Current snapshots of the direct replies to `parent`
    pub fn children_of(&self, parent: &EntityId) -> Vec<EntitySnapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.parent_ref.as_ref() == Some(parent))
            .map(|s| s.value().clone())
            .collect()
    }

    /// All snapshots, sorted by entity id
    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        let mut all: Vec<_> = self.snapshots.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    pub fn contains_op(&self, op_id: &OpId) -> bool {
        self.applied.contains(op_id)
    }

    /// Whether `actor` currently favorites `entity_id`
    pub fn favorite_state(&self, actor: &ActorId, entity_id: &EntityId) -> bool {
        self.favorite_op(actor, entity_id)
            .map_or(false, |op| op.op_type == OpType::Favorite)
    }

    /// Winning favorite/unfavorite op for `(actor, entity)`
    pub fn favorite_op(&self, actor: &ActorId, entity_id: &EntityId) -> Option<Op> {
        let key = FavoriteKey {
            actor: actor.clone(),
            entity_id: entity_id.clone(),
        };
        self.favorites.get(&key).map(|op| op.value().clone())
    }

    /// Entities `actor` currently favorites, sorted
    pub fn favorites_of(&self, actor: &ActorId) -> Vec<EntityId> {
        let mut ids: Vec<_> = self
            .favorites
            .iter()
            .filter(|e| &e.key().actor == actor && e.value().op_type == OpType::Favorite)
            .map(|e| e.key().entity_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn favorite_count(&self, entity_id: &EntityId) -> usize {
        self.favorites
            .iter()
            .filter(|e| &e.key().entity_id == entity_id && e.value().op_type == OpType::Favorite)
            .count()
    }

    /// Winning favorite ops with `lamport > since`, ascending, paged like
    /// [`DigestIndex::since`]
    pub fn favorite_ops_since(&self, since: u64, limit: usize) -> Vec<Op> {
        let mut ops: Vec<Op> = self
            .favorites
            .iter()
            .filter(|e| e.value().lamport > since)
            .map(|e| e.value().clone())
            .collect();
        ops.sort_by(|a, b| a.merge_cmp(b));

        let mut end = ops.len().min(limit);
        if end > 0 {
            let boundary = ops[end - 1].lamport;
            while end < ops.len() && ops[end].lamport == boundary {
                end += 1;
            }
        }
        ops.truncate(end);
        ops
    }

    pub fn digests(&self) -> &DigestIndex {
        &self.digests
    }

    pub fn entity_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Number of applied ops, favorites included
    pub fn op_count(&self) -> usize {
        self.applied.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentId;
    use concord_storage::MemoryStorage;
    use proptest::prelude::*;

    async fn new_log() -> OperationLog {
        OperationLog::open(Arc::new(MemoryStorage::new())).await.unwrap()
    }

    fn create(entity: &str, actor: &str, lamport: u64) -> Op {
        Op::new(EntityId::from(entity), OpType::Create, ActorId::from(actor), lamport, 1_000)
            .with_content(Some(ContentId::new(format!("cid-{}", entity))))
    }

    fn delete(entity: &str, actor: &str, lamport: u64) -> Op {
        Op::new(EntityId::from(entity), OpType::Delete, ActorId::from(actor), lamport, 2_000)
            .with_content(Some(ContentId::new(format!("cid-{}", entity))))
    }

    fn favorite(entity: &str, actor: &str, lamport: u64, on: bool) -> Op {
        let op_type = if on { OpType::Favorite } else { OpType::Unfavorite };
        Op::new(EntityId::from(entity), op_type, ActorId::from(actor), lamport, 3_000)
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let log = new_log().await;
        let op = create("p1", "alice", 3);

        assert_eq!(log.apply(op.clone()).await.unwrap(), ApplyOutcome::Applied);
        let snapshot = log.snapshot(&op.entity_id).unwrap();
        let history_len = log.history(&op.entity_id).len();

        assert_eq!(log.apply(op.clone()).await.unwrap(), ApplyOutcome::Superseded);
        assert_eq!(log.snapshot(&op.entity_id).unwrap(), snapshot);
        assert_eq!(log.history(&op.entity_id).len(), history_len);
        assert_eq!(log.op_count(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_is_permanent() {
        let log = new_log().await;
        let id = EntityId::from("p1");

        assert!(log.apply(delete("p1", "alice", 10)).await.unwrap().is_applied());
        assert_eq!(
            log.apply(create("p1", "alice", 5)).await.unwrap(),
            ApplyOutcome::Superseded
        );

        let snapshot = log.snapshot(&id).unwrap();
        assert!(snapshot.deleted);
        assert!(snapshot.content_id.is_none());
        assert_eq!(log.history(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_keeps_prior_content_in_history() {
        let log = new_log().await;
        let id = EntityId::from("p1");

        log.apply(create("p1", "alice", 3)).await.unwrap();
        log.apply(delete("p1", "alice", 7)).await.unwrap();

        let snapshot = log.snapshot(&id).unwrap();
        assert!(snapshot.deleted);
        assert!(snapshot.content_id.is_none());

        let history = log.history(&id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content_id, Some(ContentId::from("cid-p1")));
        assert_eq!(crate::entity::fold(&history).unwrap(), snapshot);

        let digest = log.digests().get(&id).unwrap();
        assert!(digest.deleted);
        assert_eq!(digest.lamport, 7);
        assert_eq!(digest.to_op(), history[1]);
    }

    #[tokio::test]
    async fn test_reloaded_delete_digest_keeps_content_id() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let id = EntityId::from("p1");
        {
            let log = OperationLog::open(storage.clone()).await.unwrap();
            log.apply(create("p1", "alice", 3)).await.unwrap();
            log.apply(delete("p1", "alice", 7)).await.unwrap();
        }

        let log = OperationLog::open(storage).await.unwrap();
        let digest = log.digests().get(&id).unwrap();
        assert!(digest.deleted);
        assert_eq!(digest.content_id, Some(ContentId::from("cid-p1")));
    }

    #[tokio::test]
    async fn test_invalid_op_is_rejected() {
        let log = new_log().await;
        let op = create("p1", "", 1);

        assert!(matches!(log.apply(op).await.unwrap(), ApplyOutcome::Rejected(_)));
        assert_eq!(log.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_favorite_converges_in_either_order() {
        let on = favorite("p1", "bob", 5, true);
        let off = favorite("p1", "bob", 8, false);
        let actor = ActorId::from("bob");
        let id = EntityId::from("p1");

        let a = new_log().await;
        a.apply(on.clone()).await.unwrap();
        a.apply(off.clone()).await.unwrap();

        let b = new_log().await;
        b.apply(off).await.unwrap();
        assert_eq!(b.apply(on).await.unwrap(), ApplyOutcome::Superseded);

        assert!(!a.favorite_state(&actor, &id));
        assert!(!b.favorite_state(&actor, &id));
        assert_eq!(a.favorite_op(&actor, &id), b.favorite_op(&actor, &id));
    }

    #[tokio::test]
    async fn test_favorites_are_independent_per_actor() {
        let log = new_log().await;
        log.apply(create("p1", "alice", 1)).await.unwrap();
        log.apply(favorite("p1", "bob", 2, true)).await.unwrap();
        log.apply(favorite("p1", "carol", 3, true)).await.unwrap();
        log.apply(favorite("p1", "carol", 4, false)).await.unwrap();
        log.apply(delete("p1", "alice", 5)).await.unwrap();

        let id = EntityId::from("p1");
        assert!(log.favorite_state(&ActorId::from("bob"), &id));
        assert!(!log.favorite_state(&ActorId::from("carol"), &id));
        assert_eq!(log.favorite_count(&id), 1);
        assert_eq!(log.favorites_of(&ActorId::from("bob")), vec![id.clone()]);
        // Favorite ops never touch the entity snapshot
        assert_eq!(log.history(&id).len(), 2);
    }

    #[tokio::test]
    async fn test_favorite_ops_since_pages() {
        let log = new_log().await;
        log.apply(favorite("p1", "bob", 2, true)).await.unwrap();
        log.apply(favorite("p2", "bob", 4, true)).await.unwrap();
        log.apply(favorite("p3", "carol", 4, true)).await.unwrap();
        log.apply(favorite("p4", "dave", 6, true)).await.unwrap();

        let page = log.favorite_ops_since(0, 2);
        let lamports: Vec<_> = page.iter().map(|op| op.lamport).collect();
        assert_eq!(lamports, vec![2, 4, 4]);

        let next = log.favorite_ops_since(4, 2);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].lamport, 6);
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_state_untouched() {
        let storage = Arc::new(MemoryStorage::new());
        let log = OperationLog::open(storage.clone()).await.unwrap();
        let op = create("p1", "alice", 1);

        storage.set_fail_writes(true);
        assert!(log.apply(op.clone()).await.is_err());
        assert!(log.snapshot(&op.entity_id).is_none());
        assert!(!log.contains_op(&op.op_id));
        assert!(log.digests().is_empty());

        storage.set_fail_writes(false);
        assert!(log.apply(op).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_state() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let log = OperationLog::open(storage.clone()).await.unwrap();
            log.apply(create("p1", "alice", 1)).await.unwrap();
            log.apply(create("p2", "alice", 2)).await.unwrap();
            log.apply(delete("p1", "alice", 3)).await.unwrap();
            log.apply(favorite("p2", "bob", 4, true)).await.unwrap();
        }

        let log = OperationLog::open(storage).await.unwrap();
        assert_eq!(log.entity_count(), 2);
        assert!(log.snapshot(&EntityId::from("p1")).unwrap().deleted);
        assert_eq!(log.history(&EntityId::from("p1")).len(), 2);
        assert!(log.favorite_state(&ActorId::from("bob"), &EntityId::from("p2")));
        assert_eq!(log.digests().len(), 2);
        assert_eq!(log.op_count(), 4);

        // Replays after restart are still recognised
        assert_eq!(
            log.apply(create("p2", "alice", 2)).await.unwrap(),
            ApplyOutcome::Superseded
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_on_one_entity() {
        let log = Arc::new(new_log().await);

        let mut handles = Vec::new();
        for lamport in 1..=20u64 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let op = if lamport % 2 == 0 {
                    delete("p1", "alice", lamport)
                } else {
                    create("p1", "alice", lamport)
                };
                log.apply(op).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = log.snapshot(&EntityId::from("p1")).unwrap();
        assert_eq!(snapshot.lamport, 20);
        assert!(snapshot.deleted);
        let history = log.history(&EntityId::from("p1"));
        assert_eq!(crate::entity::fold(&history).unwrap(), snapshot);
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        (0..3usize, 0..3usize, 0..4usize, 1..12u64).prop_map(|(e, a, t, lamport)| {
            let entity = format!("e{}", e);
            let actor = format!("actor{}", a);
            match t {
                0 => create(&entity, &actor, lamport),
                1 => delete(&entity, &actor, lamport),
                2 => favorite(&entity, &actor, lamport, true),
                _ => favorite(&entity, &actor, lamport, false),
            }
        })
    }

    fn arb_delivery() -> impl Strategy<Value = (Vec<Op>, Vec<Op>)> {
        prop::collection::vec(arb_op(), 1..24)
            .prop_flat_map(|ops| (Just(ops.clone()), Just(ops).prop_shuffle()))
    }

    async fn replay(ops: &[Op]) -> OperationLog {
        let log = new_log().await;
        for op in ops {
            log.apply(op.clone()).await.unwrap();
        }
        log
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn prop_any_delivery_order_converges((ordered, shuffled) in arb_delivery()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (a, b) = rt.block_on(async { (replay(&ordered).await, replay(&shuffled).await) });

            prop_assert_eq!(a.snapshots(), b.snapshots());
            for actor in ["actor0", "actor1", "actor2"] {
                let actor = ActorId::from(actor);
                for entity in ["e0", "e1", "e2"] {
                    let entity = EntityId::from(entity);
                    prop_assert_eq!(a.favorite_op(&actor, &entity), b.favorite_op(&actor, &entity));
                }
            }
            prop_assert_eq!(a.digests().since(0, 100), b.digests().since(0, 100));
        }
    }
}
