//! Digest index: one compact summary per entity, ordered by lamport

use crate::content::ContentId;
use crate::entity::EntitySnapshot;
use crate::op::{ActorId, EntityId, Op, OpId, OpType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Per-entity summary exchanged during reconciliation. Never carries bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub entity_id: EntityId,
    pub actor: ActorId,
    pub op_id: OpId,
    pub op_type: OpType,
    pub lamport: u64,
    pub deleted: bool,
    #[serde(default)]
    pub content_id: Option<ContentId>,
    pub timestamp: i64,
    #[serde(default)]
    pub parent_ref: Option<EntityId>,
}

impl Digest {
    /// Rebuild the op this digest summarizes
    pub fn to_op(&self) -> Op {
        Op {
            entity_id: self.entity_id.clone(),
            op_id: self.op_id.clone(),
            op_type: self.op_type,
            actor: self.actor.clone(),
            lamport: self.lamport,
            timestamp: self.timestamp,
            content_id: self.content_id.clone(),
            parent_ref: self.parent_ref.clone(),
        }
    }
}

/// Digest of an entity whose winning op is `op`. A delete keeps the content
/// id it tombstoned, so peers rebuilding the op from the digest store the
/// same delete the author did.
impl From<&Op> for Digest {
    fn from(op: &Op) -> Self {
        Self {
            entity_id: op.entity_id.clone(),
            actor: op.actor.clone(),
            op_id: op.op_id.clone(),
            op_type: op.op_type,
            lamport: op.lamport,
            deleted: op.op_type == OpType::Delete,
            content_id: op.content_id.clone(),
            timestamp: op.timestamp,
            parent_ref: op.parent_ref.clone(),
        }
    }
}

impl From<&EntitySnapshot> for Digest {
    fn from(s: &EntitySnapshot) -> Self {
        Self {
            entity_id: s.entity_id.clone(),
            actor: s.actor.clone(),
            op_id: s.current_op_id.clone(),
            op_type: s.op_type,
            lamport: s.lamport,
            deleted: s.deleted,
            content_id: s.content_id.clone(),
            timestamp: s.timestamp,
            parent_ref: s.parent_ref.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    ordered: BTreeMap<(u64, EntityId), Digest>,
    lamport_of: HashMap<EntityId, u64>,
}

/// Digests ordered by `(lamport, entity_id)`
#[derive(Default)]
pub struct DigestIndex {
    inner: RwLock<Inner>,
}

impl DigestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the digest for `digest.entity_id`
    pub fn upsert(&self, digest: Digest) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.lamport_of.remove(&digest.entity_id) {
            inner.ordered.remove(&(old, digest.entity_id.clone()));
        }
        inner
            .lamport_of
            .insert(digest.entity_id.clone(), digest.lamport);
        inner
            .ordered
            .insert((digest.lamport, digest.entity_id.clone()), digest);
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Digest> {
        let inner = self.inner.read();
        let lamport = *inner.lamport_of.get(entity_id)?;
        inner.ordered.get(&(lamport, entity_id.clone())).cloned()
    }

    /// Up to `limit` digests with `lamport > since`, ascending.
    ///
    /// A page never splits a group of equal lamports: if the limit falls
    /// inside one, the rest of the group is included so a cursor of "last
    /// returned lamport" cannot skip entities.
    pub fn since(&self, since: u64, limit: usize) -> Vec<Digest> {
        let inner = self.inner.read();
        let start = match since.checked_add(1) {
            Some(start) => start,
            None => return Vec::new(),
        };

        let mut page: Vec<Digest> = Vec::new();
        for ((lamport, _), digest) in inner
            .ordered
            .range((Bound::Included((start, EntityId::new(""))), Bound::Unbounded))
        {
            if page.len() >= limit {
                match page.last() {
                    Some(last) if last.lamport == *lamport => {}
                    _ => break,
                }
            }
            page.push(digest.clone());
        }
        page
    }

    pub fn len(&self) -> usize {
        self.inner.read().lamport_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest lamport in the index
    pub fn max_lamport(&self) -> u64 {
        self.inner
            .read()
            .ordered
            .keys()
            .next_back()
            .map(|(l, _)| *l)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(entity: &str, lamport: u64) -> Digest {
        Digest {
            entity_id: EntityId::from(entity),
            actor: ActorId::from("alice"),
            op_id: OpId::new(format!("{}-{}", entity, lamport)),
            op_type: OpType::Create,
            lamport,
            deleted: false,
            content_id: Some(ContentId::from("cid-1")),
            timestamp: 0,
            parent_ref: None,
        }
    }

    #[test]
    fn test_upsert_replaces() {
        let index = DigestIndex::new();
        index.upsert(digest("a", 1));
        index.upsert(digest("a", 5));

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&EntityId::from("a")).unwrap().lamport, 5);
        assert!(index.since(1, 10).iter().all(|d| d.lamport == 5));
        assert_eq!(index.max_lamport(), 5);
    }

    #[test]
    fn test_since_pages_in_order() {
        let index = DigestIndex::new();
        for l in (1..=10).rev() {
            index.upsert(digest(&format!("e{}", l), l));
        }

        let first = index.since(0, 4);
        let lamports: Vec<_> = first.iter().map(|d| d.lamport).collect();
        assert_eq!(lamports, vec![1, 2, 3, 4]);

        let rest = index.since(4, 100);
        assert_eq!(rest.len(), 6);
        assert!(index.since(10, 4).is_empty());
        assert!(index.since(u64::MAX, 4).is_empty());
    }

    #[test]
    fn test_since_keeps_equal_lamport_groups_whole() {
        let index = DigestIndex::new();
        index.upsert(digest("a", 1));
        index.upsert(digest("b", 2));
        index.upsert(digest("c", 2));
        index.upsert(digest("d", 2));
        index.upsert(digest("e", 3));

        let page = index.since(0, 2);
        let ids: Vec<_> = page.iter().map(|d| d.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);

        // Cursor = last lamport returned; nothing is skipped
        let next = index.since(2, 2);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].entity_id.as_str(), "e");
    }

    #[test]
    fn test_delete_digest_keeps_content_id() {
        let create = Op::new(EntityId::from("p1"), OpType::Create, ActorId::from("alice"), 1, 5)
            .with_content(Some(ContentId::from("cid-p1")));
        let delete = Op::new(EntityId::from("p1"), OpType::Delete, ActorId::from("alice"), 2, 6)
            .with_content(create.content_id.clone());

        let d = Digest::from(&delete);
        assert!(d.deleted);
        assert_eq!(d.content_id, Some(ContentId::from("cid-p1")));
        assert_eq!(d.to_op(), delete);

        // The snapshot drops the body reference, the digest must not
        assert!(EntitySnapshot::from_op(&delete).content_id.is_none());
    }

    #[test]
    fn test_digest_round_trips_to_op() {
        let d = digest("a", 3);
        let op = d.to_op();
        assert_eq!(op.op_id, d.op_id);
        assert_eq!(op.lamport, 3);
        assert!(op.validate().is_ok());
    }
}
