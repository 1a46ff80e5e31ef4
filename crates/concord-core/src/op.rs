//! Operations, identifiers and the merge order

use crate::content::ContentId;
use crate::error::{Error, Result};
use crate::hash::joined_hex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

string_id!(
    /// Public key of an actor
    ActorId
);

string_id!(
    /// Deterministic entity identifier
    EntityId
);

string_id!(
    /// Deterministic operation identifier
    OpId
);

impl EntityId {
    /// `hex(sha256(actor | timestamp | payload))`
    pub fn derive(actor: &ActorId, timestamp: i64, payload: &[u8]) -> Self {
        let payload = String::from_utf8_lossy(payload);
        Self(joined_hex(&[actor.as_str(), &timestamp.to_string(), &payload]))
    }
}

impl OpId {
    /// `hex(sha256(actor | timestamp | op_type | entity_id | lamport))`
    pub fn derive(
        actor: &ActorId,
        timestamp: i64,
        op_type: OpType,
        entity_id: &EntityId,
        lamport: u64,
    ) -> Self {
        Self(joined_hex(&[
            actor.as_str(),
            &timestamp.to_string(),
            op_type.as_str(),
            entity_id.as_str(),
            &lamport.to_string(),
        ]))
    }
}

/// Operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Create,
    Delete,
    Favorite,
    Unfavorite,
}

impl OpType {
    /// Tie-break rank when lamport and actor agree; delete wins ties
    pub fn priority(&self) -> u8 {
        match self {
            OpType::Create => 0,
            OpType::Favorite => 1,
            OpType::Unfavorite => 2,
            OpType::Delete => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Delete => "delete",
            OpType::Favorite => "favorite",
            OpType::Unfavorite => "unfavorite",
        }
    }

    /// Favorite and unfavorite ops touch the per-actor register, not the entity
    pub fn is_favorite(&self) -> bool {
        matches!(self, OpType::Favorite | OpType::Unfavorite)
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(OpType::Create),
            "delete" => Ok(OpType::Delete),
            "favorite" => Ok(OpType::Favorite),
            "unfavorite" => Ok(OpType::Unfavorite),
            _ => Err(Error::validation(format!("unknown op type: {}", s))),
        }
    }
}

/// A replicated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub entity_id: EntityId,
    pub op_id: OpId,
    pub op_type: OpType,
    pub actor: ActorId,
    pub lamport: u64,
    /// Wall-clock milliseconds supplied by the authoring peer
    pub timestamp: i64,
    #[serde(default)]
    pub content_id: Option<ContentId>,
    #[serde(default)]
    pub parent_ref: Option<EntityId>,
}

impl Op {
    /// Build an op, deriving its id
    pub fn new(
        entity_id: EntityId,
        op_type: OpType,
        actor: ActorId,
        lamport: u64,
        timestamp: i64,
    ) -> Self {
        let op_id = OpId::derive(&actor, timestamp, op_type, &entity_id, lamport);
        Self {
            entity_id,
            op_id,
            op_type,
            actor,
            lamport,
            timestamp,
            content_id: None,
            parent_ref: None,
        }
    }

    pub fn with_content(mut self, content_id: Option<ContentId>) -> Self {
        self.content_id = content_id;
        self
    }

    pub fn with_parent(mut self, parent_ref: Option<EntityId>) -> Self {
        self.parent_ref = parent_ref;
        self
    }

    /// Structural checks; ids are not re-derived since peers are trusted
    /// to hash honestly.
    pub fn validate(&self) -> Result<()> {
        if self.actor.is_empty() {
            return Err(Error::validation("op is missing actor"));
        }
        if self.entity_id.is_empty() {
            return Err(Error::validation("op is missing entity id"));
        }
        if self.op_id.is_empty() {
            return Err(Error::validation("op is missing op id"));
        }
        if self.lamport > MAX_LAMPORT {
            return Err(Error::validation(format!(
                "op lamport {} is out of range",
                self.lamport
            )));
        }
        if self.op_type == OpType::Create
            && self.content_id.as_ref().map_or(true, |c| c.is_empty())
        {
            return Err(Error::validation("create op is missing content id"));
        }
        Ok(())
    }

    /// Merge order: lamport, actor, op type priority, op id
    pub fn merge_cmp(&self, other: &Op) -> Ordering {
        order_key_cmp(
            (self.lamport, &self.actor, self.op_type, &self.op_id),
            (other.lamport, &other.actor, other.op_type, &other.op_id),
        )
    }

    /// True when `self` beats `other` in the merge order
    pub fn wins_over(&self, other: &Op) -> bool {
        self.merge_cmp(other) == Ordering::Greater
    }
}

/// Compare two `(lamport, actor, op_type, op_id)` keys in merge order
pub fn order_key_cmp(
    a: (u64, &ActorId, OpType, &OpId),
    b: (u64, &ActorId, OpType, &OpId),
) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| a.1.cmp(b.1))
        .then_with(|| a.2.priority().cmp(&b.2.priority()))
        .then_with(|| a.3.cmp(b.3))
}

/// Largest lamport a replica accepts. Lamports double as signed storage
/// sort keys, so anything above `i64::MAX` would not survive a reload.
pub const MAX_LAMPORT: u64 = i64::MAX as u64;

/// Storage sort key for a lamport
pub(crate) fn lamport_key(lamport: u64) -> Result<i64> {
    i64::try_from(lamport)
        .map_err(|_| Error::validation(format!("lamport {} is out of range", lamport)))
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(lamport: u64, actor: &str, op_type: OpType) -> Op {
        Op::new(EntityId::from("e1"), op_type, ActorId::from(actor), lamport, 1000)
            .with_content(Some(ContentId::from("cid-x")))
    }

    #[test]
    fn test_ids_are_deterministic() {
        let actor = ActorId::from("alice");
        let a = EntityId::derive(&actor, 42, b"hello");
        let b = EntityId::derive(&actor, 42, b"hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, EntityId::derive(&actor, 43, b"hello"));

        let o1 = OpId::derive(&actor, 42, OpType::Create, &a, 1);
        let o2 = OpId::derive(&actor, 42, OpType::Delete, &a, 1);
        assert_ne!(o1, o2);
    }

    #[test]
    fn test_lamport_dominates() {
        assert!(op(5, "zed", OpType::Create).wins_over(&op(4, "amy", OpType::Delete)));
    }

    #[test]
    fn test_actor_breaks_lamport_ties() {
        assert!(op(5, "bob", OpType::Create).wins_over(&op(5, "alice", OpType::Delete)));
    }

    #[test]
    fn test_delete_wins_full_ties() {
        let create = op(5, "alice", OpType::Create);
        let delete = op(5, "alice", OpType::Delete);
        assert!(delete.wins_over(&create));
        assert!(!create.wins_over(&delete));

        let fav = op(5, "alice", OpType::Favorite);
        let unfav = op(5, "alice", OpType::Unfavorite);
        assert!(unfav.wins_over(&fav));
        assert!(fav.wins_over(&create));
    }

    #[test]
    fn test_order_is_total() {
        let a = op(5, "alice", OpType::Create);
        let mut b = a.clone();
        b.op_id = OpId::from("zzz");
        assert_ne!(a.merge_cmp(&b), Ordering::Equal);
        assert_eq!(a.merge_cmp(&a), Ordering::Equal);
    }

    #[test]
    fn test_validate() {
        assert!(op(1, "alice", OpType::Create).validate().is_ok());
        assert!(op(1, "", OpType::Create).validate().is_err());

        let missing_content = op(1, "alice", OpType::Create).with_content(None);
        assert!(missing_content.validate().is_err());

        // Deletes and favorites do not need content
        assert!(op(1, "alice", OpType::Delete).with_content(None).validate().is_ok());

        let mut no_id = op(1, "alice", OpType::Delete);
        no_id.op_id = OpId::from("");
        assert!(no_id.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unstorable_lamports() {
        assert!(op(MAX_LAMPORT, "alice", OpType::Create).validate().is_ok());
        assert!(op(MAX_LAMPORT + 1, "alice", OpType::Create).validate().is_err());
        assert!(op(u64::MAX, "alice", OpType::Delete).validate().is_err());

        assert_eq!(lamport_key(MAX_LAMPORT).unwrap(), i64::MAX);
        assert!(lamport_key(u64::MAX).is_err());
    }

    #[test]
    fn test_op_type_serde_is_lowercase() {
        let json = serde_json::to_string(&OpType::Unfavorite).unwrap();
        assert_eq!(json, "\"unfavorite\"");
        assert_eq!("DELETE".parse::<OpType>().unwrap(), OpType::Delete);
    }
}
