//! Entity snapshots

use crate::content::ContentId;
use crate::op::{ActorId, EntityId, Op, OpId, OpType};
use serde::{Deserialize, Serialize};

/// Projection of an entity's winning op.
///
/// Every field is a function of the current op alone, so two replicas that
/// agree on the winner agree on the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    pub current_op_id: OpId,
    pub op_type: OpType,
    pub lamport: u64,
    pub deleted: bool,
    pub content_id: Option<ContentId>,
    pub actor: ActorId,
    pub parent_ref: Option<EntityId>,
    pub timestamp: i64,
}

impl EntitySnapshot {
    /// Snapshot for an entity whose current op is `op`
    pub fn from_op(op: &Op) -> Self {
        let deleted = op.op_type == OpType::Delete;
        Self {
            entity_id: op.entity_id.clone(),
            current_op_id: op.op_id.clone(),
            op_type: op.op_type,
            lamport: op.lamport,
            deleted,
            content_id: if deleted { None } else { op.content_id.clone() },
            actor: op.actor.clone(),
            parent_ref: op.parent_ref.clone(),
            timestamp: op.timestamp,
        }
    }

    /// Whether `op` beats the op this snapshot was built from
    pub fn is_beaten_by(&self, op: &Op) -> bool {
        crate::op::order_key_cmp(
            (op.lamport, &op.actor, op.op_type, &op.op_id),
            (self.lamport, &self.actor, self.op_type, &self.current_op_id),
        ) == std::cmp::Ordering::Greater
    }

    pub fn is_comment(&self) -> bool {
        self.parent_ref.is_some()
    }
}

/// Fold an entity history into its snapshot
pub fn fold<'a>(ops: impl IntoIterator<Item = &'a Op>) -> Option<EntitySnapshot> {
    ops.into_iter()
        .filter(|op| !op.op_type.is_favorite())
        .max_by(|a, b| a.merge_cmp(b))
        .map(EntitySnapshot::from_op)
}
