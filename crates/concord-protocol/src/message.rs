//! Typed peer messages

use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult};
use concord_core::{ActorId, ContentId, Digest, GovernancePolicy, ModerationRecord, Op, Report};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Known message kinds, plus `Unknown` for any other tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Identity,
    Op,
    PostFetchRequest,
    PostFetchResponse,
    SyncDigestRequest,
    SyncDigestResponse,
    FavoriteOp,
    FavoriteSyncRequest,
    FavoriteSyncResponse,
    Report,
    ModerationOp,
    GovernancePolicyUpdate,
    ModerationSyncRequest,
    ModerationSyncResponse,
    Unknown,
}

impl MessageKind {
    /// Every kind that has a handler
    pub const KNOWN: [MessageKind; 14] = [
        MessageKind::Identity,
        MessageKind::Op,
        MessageKind::PostFetchRequest,
        MessageKind::PostFetchResponse,
        MessageKind::SyncDigestRequest,
        MessageKind::SyncDigestResponse,
        MessageKind::FavoriteOp,
        MessageKind::FavoriteSyncRequest,
        MessageKind::FavoriteSyncResponse,
        MessageKind::Report,
        MessageKind::ModerationOp,
        MessageKind::GovernancePolicyUpdate,
        MessageKind::ModerationSyncRequest,
        MessageKind::ModerationSyncResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Identity => "IDENTITY",
            MessageKind::Op => "OP",
            MessageKind::PostFetchRequest => "POST_FETCH_REQUEST",
            MessageKind::PostFetchResponse => "POST_FETCH_RESPONSE",
            MessageKind::SyncDigestRequest => "SYNC_DIGEST_REQUEST",
            MessageKind::SyncDigestResponse => "SYNC_DIGEST_RESPONSE",
            MessageKind::FavoriteOp => "FAVORITE_OP",
            MessageKind::FavoriteSyncRequest => "FAVORITE_SYNC_REQUEST",
            MessageKind::FavoriteSyncResponse => "FAVORITE_SYNC_RESPONSE",
            MessageKind::Report => "REPORT",
            MessageKind::ModerationOp => "MODERATION_OP",
            MessageKind::GovernancePolicyUpdate => "GOVERNANCE_POLICY_UPDATE",
            MessageKind::ModerationSyncRequest => "MODERATION_SYNC_REQUEST",
            MessageKind::ModerationSyncResponse => "MODERATION_SYNC_RESPONSE",
            MessageKind::Unknown => "UNKNOWN",
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        Self::KNOWN
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(tag.trim()))
            .unwrap_or(MessageKind::Unknown)
    }

    /// Replies to a request sent on the same stream
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageKind::PostFetchResponse
                | MessageKind::SyncDigestResponse
                | MessageKind::FavoriteSyncResponse
                | MessageKind::ModerationSyncResponse
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub peer_id: String,
    pub actor: ActorId,
}

/// A replicated op, optionally with its body inlined (hex encoded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPayload {
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl OpPayload {
    pub fn new(op: Op, content: Option<&[u8]>) -> Self {
        Self {
            op,
            content: content.map(hex::encode),
        }
    }

    pub fn content_bytes(&self) -> ProtocolResult<Option<Vec<u8>>> {
        decode_hex(self.content.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostFetchRequest {
    pub request_id: String,
    pub content_id: ContentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostFetchResponse {
    pub request_id: String,
    pub content_id: ContentId,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl PostFetchResponse {
    pub fn found(request_id: String, content_id: ContentId, bytes: &[u8]) -> Self {
        Self {
            request_id,
            content_id,
            found: true,
            content: Some(hex::encode(bytes)),
        }
    }

    pub fn missing(request_id: String, content_id: ContentId) -> Self {
        Self {
            request_id,
            content_id,
            found: false,
            content: None,
        }
    }

    pub fn content_bytes(&self) -> ProtocolResult<Option<Vec<u8>>> {
        decode_hex(self.content.as_deref())
    }
}

/// Page request: entries with `lamport > since_lamport`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub request_id: String,
    pub since_lamport: u64,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDigestResponse {
    pub request_id: String,
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteSyncResponse {
    pub request_id: String,
    pub ops: Vec<Op>,
}

/// One page of moderation registers, with the current policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationSyncResponse {
    pub request_id: String,
    pub records: Vec<ModerationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<GovernancePolicy>,
}

/// A decoded peer message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Identity(IdentityPayload),
    Op(OpPayload),
    PostFetchRequest(PostFetchRequest),
    PostFetchResponse(PostFetchResponse),
    SyncDigestRequest(SyncRequest),
    SyncDigestResponse(SyncDigestResponse),
    FavoriteOp(Op),
    FavoriteSyncRequest(SyncRequest),
    FavoriteSyncResponse(FavoriteSyncResponse),
    Report(Report),
    ModerationOp(ModerationRecord),
    GovernancePolicyUpdate(GovernancePolicy),
    ModerationSyncRequest(SyncRequest),
    ModerationSyncResponse(ModerationSyncResponse),
    /// Well-formed envelope with an unrecognised tag
    Unknown(String),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Identity(_) => MessageKind::Identity,
            Message::Op(_) => MessageKind::Op,
            Message::PostFetchRequest(_) => MessageKind::PostFetchRequest,
            Message::PostFetchResponse(_) => MessageKind::PostFetchResponse,
            Message::SyncDigestRequest(_) => MessageKind::SyncDigestRequest,
            Message::SyncDigestResponse(_) => MessageKind::SyncDigestResponse,
            Message::FavoriteOp(_) => MessageKind::FavoriteOp,
            Message::FavoriteSyncRequest(_) => MessageKind::FavoriteSyncRequest,
            Message::FavoriteSyncResponse(_) => MessageKind::FavoriteSyncResponse,
            Message::Report(_) => MessageKind::Report,
            Message::ModerationOp(_) => MessageKind::ModerationOp,
            Message::GovernancePolicyUpdate(_) => MessageKind::GovernancePolicyUpdate,
            Message::ModerationSyncRequest(_) => MessageKind::ModerationSyncRequest,
            Message::ModerationSyncResponse(_) => MessageKind::ModerationSyncResponse,
            Message::Unknown(_) => MessageKind::Unknown,
        }
    }

    /// Request id carried by request/response messages
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Message::PostFetchRequest(m) => Some(&m.request_id),
            Message::PostFetchResponse(m) => Some(&m.request_id),
            Message::SyncDigestRequest(m)
            | Message::FavoriteSyncRequest(m)
            | Message::ModerationSyncRequest(m) => Some(&m.request_id),
            Message::SyncDigestResponse(m) => Some(&m.request_id),
            Message::FavoriteSyncResponse(m) => Some(&m.request_id),
            Message::ModerationSyncResponse(m) => Some(&m.request_id),
            _ => None,
        }
    }

    pub fn to_envelope(&self, timestamp: i64) -> ProtocolResult<Envelope> {
        let payload = match self {
            Message::Identity(m) => serde_json::to_value(m)?,
            Message::Op(m) => serde_json::to_value(m)?,
            Message::PostFetchRequest(m) => serde_json::to_value(m)?,
            Message::PostFetchResponse(m) => serde_json::to_value(m)?,
            Message::SyncDigestRequest(m) => serde_json::to_value(m)?,
            Message::SyncDigestResponse(m) => serde_json::to_value(m)?,
            Message::FavoriteOp(m) => serde_json::to_value(m)?,
            Message::FavoriteSyncRequest(m) => serde_json::to_value(m)?,
            Message::FavoriteSyncResponse(m) => serde_json::to_value(m)?,
            Message::Report(m) => serde_json::to_value(m)?,
            Message::ModerationOp(m) => serde_json::to_value(m)?,
            Message::GovernancePolicyUpdate(m) => serde_json::to_value(m)?,
            Message::ModerationSyncRequest(m) => serde_json::to_value(m)?,
            Message::ModerationSyncResponse(m) => serde_json::to_value(m)?,
            Message::Unknown(tag) => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "cannot encode unknown message kind {}",
                    tag
                )))
            }
        };
        Ok(Envelope::new(self.kind().as_str(), payload, timestamp))
    }

    pub fn from_envelope(envelope: Envelope) -> ProtocolResult<Self> {
        let Envelope { kind, payload, .. } = envelope;
        let message = match MessageKind::from_tag(&kind) {
            MessageKind::Identity => Message::Identity(typed(payload)?),
            MessageKind::Op => Message::Op(typed(payload)?),
            MessageKind::PostFetchRequest => Message::PostFetchRequest(typed(payload)?),
            MessageKind::PostFetchResponse => Message::PostFetchResponse(typed(payload)?),
            MessageKind::SyncDigestRequest => Message::SyncDigestRequest(typed(payload)?),
            MessageKind::SyncDigestResponse => Message::SyncDigestResponse(typed(payload)?),
            MessageKind::FavoriteOp => Message::FavoriteOp(typed(payload)?),
            MessageKind::FavoriteSyncRequest => Message::FavoriteSyncRequest(typed(payload)?),
            MessageKind::FavoriteSyncResponse => Message::FavoriteSyncResponse(typed(payload)?),
            MessageKind::Report => Message::Report(typed(payload)?),
            MessageKind::ModerationOp => Message::ModerationOp(typed(payload)?),
            MessageKind::GovernancePolicyUpdate => {
                Message::GovernancePolicyUpdate(typed(payload)?)
            }
            MessageKind::ModerationSyncRequest => Message::ModerationSyncRequest(typed(payload)?),
            MessageKind::ModerationSyncResponse => {
                Message::ModerationSyncResponse(typed(payload)?)
            }
            MessageKind::Unknown => Message::Unknown(kind),
        };
        Ok(message)
    }
}

fn typed<T: DeserializeOwned>(payload: serde_json::Value) -> ProtocolResult<T> {
    if payload.is_null() {
        return Err(ProtocolError::MissingField("payload".into()));
    }
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidField(e.to_string()))
}

fn decode_hex(content: Option<&str>) -> ProtocolResult<Option<Vec<u8>>> {
    content
        .map(|s| hex::decode(s).map_err(|e| ProtocolError::InvalidField(format!("content: {}", e))))
        .transpose()
}

/// Fresh id correlating a request with its response
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
