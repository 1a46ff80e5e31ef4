//! Local identity

use crate::op::ActorId;

/// Supplies the local actor's public key
pub trait Identity: Send + Sync {
    fn local_actor(&self) -> ActorId;
}

/// Fixed identity, e.g. loaded from configuration
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    actor: ActorId,
}

impl LocalIdentity {
    pub fn new(actor: impl Into<ActorId>) -> Self {
        Self {
            actor: actor.into(),
        }
    }
}

impl Identity for LocalIdentity {
    fn local_actor(&self) -> ActorId {
        self.actor.clone()
    }
}
