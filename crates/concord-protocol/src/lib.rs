//! Concord wire protocol
//!
//! Peers exchange newline-delimited JSON frames, each an envelope:
//!
//! ```text
//! {"type": "OP", "payload": {...}, "timestamp": 1700000000000}
//! ```
//!
//! ## Message kinds
//! ```text
//! IDENTITY                 # peer id and actor key, sent on connect
//! OP                       # a post/comment create or delete, body inlined
//! FAVORITE_OP              # a favorite or unfavorite op
//! REPORT                   # a moderation report
//! POST_FETCH_REQUEST       # fetch a body by content id
//! POST_FETCH_RESPONSE
//! SYNC_DIGEST_REQUEST      # page of entity digests since a lamport
//! SYNC_DIGEST_RESPONSE
//! FAVORITE_SYNC_REQUEST    # page of favorite ops since a lamport
//! FAVORITE_SYNC_RESPONSE
//! MODERATION_OP            # shadow ban or unban from a trusted admin
//! GOVERNANCE_POLICY_UPDATE # forum-wide moderation policy
//! MODERATION_SYNC_REQUEST  # page of moderation registers since a lamport
//! MODERATION_SYNC_RESPONSE
//! ```

pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;

pub use codec::{decode, encode, FrameDecoder, MAX_FRAME_SIZE};
pub use envelope::Envelope;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    new_request_id, FavoriteSyncResponse, IdentityPayload, Message, MessageKind,
    ModerationSyncResponse, OpPayload, PostFetchRequest, PostFetchResponse, SyncDigestResponse,
    SyncRequest,
};
