//! Concord Core - replication engine
//!
//! This crate provides the per-peer consistency machinery:
//! - Lamport logical clock with a durable high-water mark
//! - Content-addressed blob store
//! - Operation log with deterministic merge and tombstones
//! - Digest index for anti-entropy
//! - Report and notification stores
//! - Shadow-ban and governance policy registers

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

pub mod clock;
pub mod content;
pub mod digest;
pub mod entity;
pub mod error;
pub mod hash;
pub mod identity;
pub mod moderation;
pub mod notification;
pub mod op;
pub mod oplog;
pub mod replica;
pub mod report;

pub use clock::LogicalClock;
pub use content::{ContentId, ContentStore, ForumContent};
pub use digest::{Digest, DigestIndex};
pub use entity::EntitySnapshot;
pub use error::{Error, Result};
pub use identity::{Identity, LocalIdentity};
pub use moderation::{GovernancePolicy, ModerationAction, ModerationRecord, ModerationStore};
pub use notification::{Notification, NotificationKind, NotificationStore};
pub use op::{ActorId, EntityId, Op, OpId, OpType};
pub use oplog::{ApplyOutcome, OperationLog};
pub use replica::{Replica, ReplicaEvent, ReplicaStats};
pub use report::{Report, ReportStatus, ReportStore, TargetKind};
