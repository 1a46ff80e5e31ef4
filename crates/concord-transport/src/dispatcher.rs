//! Inbound frame dispatch
//!
//! Frames are decoded into [`Message`]s and routed through a table of
//! handlers keyed by [`MessageKind`]. Bad frames and failing handlers are
//! logged and skipped; neither ever closes the stream they arrived on.

use crate::config::MAX_BATCH_SIZE;
use crate::context::NodeContext;
use crate::error::{TransportError, TransportResult};
use crate::reconcile::{PeerSession, SyncReport};
use crate::stats::SyncStats;
use crate::transport::{PeerId, PeerStream, TopicFrame};
use concord_core::{ApplyOutcome, Error as CoreError, Op};
use concord_protocol::codec::decode_with_limit;
use concord_protocol::{
    FavoriteSyncResponse, Message, MessageKind, ModerationSyncResponse, PostFetchResponse,
    SyncDigestResponse, SyncRequest,
};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A message handler. Returns the reply to write back on the same stream, if any.
pub type HandlerFn = for<'a> fn(
    &'a NodeContext,
    &'a PeerId,
    Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>>;

/// Routes decoded messages to their handlers
pub struct Dispatcher {
    ctx: Arc<NodeContext>,
    handlers: HashMap<MessageKind, HandlerFn>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let mut handlers: HashMap<MessageKind, HandlerFn> = HashMap::new();
        handlers.insert(MessageKind::Identity, handle_identity);
        handlers.insert(MessageKind::Op, handle_op);
        handlers.insert(MessageKind::PostFetchRequest, handle_post_fetch_request);
        handlers.insert(MessageKind::PostFetchResponse, handle_post_fetch_response);
        handlers.insert(MessageKind::SyncDigestRequest, handle_sync_digest_request);
        handlers.insert(MessageKind::SyncDigestResponse, handle_sync_digest_response);
        handlers.insert(MessageKind::FavoriteOp, handle_favorite_op);
        handlers.insert(MessageKind::FavoriteSyncRequest, handle_favorite_sync_request);
        handlers.insert(MessageKind::FavoriteSyncResponse, handle_favorite_sync_response);
        handlers.insert(MessageKind::Report, handle_report);
        handlers.insert(MessageKind::ModerationOp, handle_moderation_op);
        handlers.insert(MessageKind::GovernancePolicyUpdate, handle_policy_update);
        handlers.insert(MessageKind::ModerationSyncRequest, handle_moderation_sync_request);
        handlers.insert(MessageKind::ModerationSyncResponse, handle_moderation_sync_response);

        Self { ctx, handlers }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Decode and handle one frame from `from`. Returns the reply, if any.
    pub async fn handle_frame(&self, from: &PeerId, frame: &[u8]) -> Option<Message> {
        let ctx: &NodeContext = &self.ctx;
        SyncStats::incr(&ctx.stats.frames_received);

        if !ctx.limiter.allow(from) {
            SyncStats::incr(&ctx.stats.rate_limited);
            warn!(peer = %from, "Rate limit exceeded, dropping frame");
            return None;
        }

        let message = match decode_with_limit(frame, ctx.config.limits.max_frame_bytes) {
            Ok(message) => message,
            Err(e) => {
                SyncStats::incr(&ctx.stats.frames_dropped);
                warn!(peer = %from, error = %e, "Dropping malformed frame");
                return None;
            }
        };

        let kind = message.kind();
        let handler = match self.handlers.get(&kind) {
            Some(handler) => *handler,
            None => {
                SyncStats::incr(&ctx.stats.frames_dropped);
                if let Message::Unknown(tag) = &message {
                    warn!(peer = %from, tag = %tag, "Dropping frame of unknown type");
                } else {
                    warn!(peer = %from, kind = %kind, "No handler registered");
                }
                return None;
            }
        };

        match handler(ctx, from, message).await {
            Ok(reply) => reply,
            Err(e) => {
                SyncStats::incr(&ctx.stats.handler_errors);
                warn!(peer = %from, kind = %kind, error = %e, "Handler failed");
                None
            }
        }
    }

    /// Serve one inbound stream until the remote side closes it
    pub async fn serve_stream(self: Arc<Self>, mut stream: PeerStream) {
        let peer = stream.peer.clone();
        debug!(peer = %peer, "Serving stream");

        while let Some(frame) = stream.incoming.recv().await {
            let reply = match self.handle_frame(&peer, &frame).await {
                Some(reply) => reply,
                None => continue,
            };
            let encoded = match self.ctx.encode(&reply) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to encode reply");
                    continue;
                }
            };
            if stream.send(encoded).await.is_err() {
                break;
            }
        }

        debug!(peer = %peer, "Stream closed");
    }

    /// Handle frames published on the topic. Replies have nowhere to go on a
    /// topic and are discarded.
    pub async fn serve_topic(self: Arc<Self>, mut frames: mpsc::Receiver<TopicFrame>) {
        while let Some(TopicFrame { from, frame }) = frames.recv().await {
            if let Some(reply) = self.handle_frame(&from, &frame).await {
                debug!(peer = %from, kind = %reply.kind(), "Discarding reply to topic frame");
            }
        }
        info!("Topic subscription ended");
    }
}

fn unexpected(expected: MessageKind, got: &Message) -> TransportError {
    TransportError::UnexpectedMessage {
        expected: expected.to_string(),
        got: got.kind().to_string(),
    }
}

fn page_limit(request: &SyncRequest) -> usize {
    request.limit.clamp(1, MAX_BATCH_SIZE)
}

fn record_outcome(ctx: &NodeContext, from: &PeerId, op: &Op, outcome: &ApplyOutcome) {
    match outcome {
        ApplyOutcome::Applied => SyncStats::incr(&ctx.stats.ops_applied),
        ApplyOutcome::Superseded => {
            debug!(peer = %from, op = %op.op_id, "Op superseded");
        }
        ApplyOutcome::Rejected(reason) => {
            warn!(peer = %from, op = %op.op_id, reason = %reason, "Rejected op");
        }
    }
}

fn handle_identity<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let identity = match message {
            Message::Identity(identity) => identity,
            other => return Err(unexpected(MessageKind::Identity, &other)),
        };
        if identity.actor.is_empty() {
            return Err(CoreError::validation("identity without actor").into());
        }
        debug!(peer = %from, actor = %identity.actor, "Peer identified");
        ctx.peer_actors.insert(from.clone(), identity.actor);
        Ok(None)
    })
}

fn handle_op<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let payload = match message {
            Message::Op(payload) => payload,
            other => return Err(unexpected(MessageKind::Op, &other)),
        };
        let content = payload.content_bytes()?;
        let op = payload.op;
        op.validate()?;

        // Without an inline body, pull it from the sender before applying
        if content.is_none() && !op.op_type.is_favorite() {
            if let Some(content_id) = op.content_id.as_ref() {
                let wins = ctx
                    .replica
                    .log()
                    .snapshot(&op.entity_id)
                    .map_or(true, |s| s.is_beaten_by(&op));
                if wins && !ctx.replica.content().contains(content_id).await? {
                    let mut session = PeerSession::new(ctx, from.clone());
                    if let Err(e) = session.fetch_content(content_id).await {
                        warn!(peer = %from, content = %content_id, error = %e, "Content fetch failed");
                    }
                }
            }
        }

        let outcome = ctx.replica.ingest_remote(op.clone(), content.as_deref()).await?;
        record_outcome(ctx, from, &op, &outcome);
        Ok(None)
    })
}

fn handle_post_fetch_request<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let request = match message {
            Message::PostFetchRequest(request) => request,
            other => return Err(unexpected(MessageKind::PostFetchRequest, &other)),
        };
        SyncStats::incr(&ctx.stats.requests_received);

        let response = match ctx.replica.content().get(&request.content_id).await {
            Ok(bytes) => PostFetchResponse::found(request.request_id, request.content_id, &bytes),
            Err(e) if e.is_not_found() => {
                debug!(peer = %from, content = %request.content_id, "Requested content not held");
                PostFetchResponse::missing(request.request_id, request.content_id)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Message::PostFetchResponse(response)))
    })
}

fn handle_post_fetch_response<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let response = match message {
            Message::PostFetchResponse(response) => response,
            other => return Err(unexpected(MessageKind::PostFetchResponse, &other)),
        };
        // Late or unsolicited: keep the body if it verifies
        if let (true, Some(bytes)) = (response.found, response.content_bytes()?) {
            ctx.replica
                .content()
                .put_verified(&response.content_id, &bytes)
                .await?;
            debug!(peer = %from, content = %response.content_id, "Stored late content");
        }
        Ok(None)
    })
}

fn handle_sync_digest_request<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let request = match message {
            Message::SyncDigestRequest(request) => request,
            other => return Err(unexpected(MessageKind::SyncDigestRequest, &other)),
        };
        SyncStats::incr(&ctx.stats.requests_received);

        let digests = ctx
            .replica
            .log()
            .digests()
            .since(request.since_lamport, page_limit(&request));
        debug!(peer = %from, since = request.since_lamport, count = digests.len(), "Serving digest page");
        Ok(Some(Message::SyncDigestResponse(SyncDigestResponse {
            request_id: request.request_id,
            digests,
        })))
    })
}

fn handle_sync_digest_response<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let response = match message {
            Message::SyncDigestResponse(response) => response,
            other => return Err(unexpected(MessageKind::SyncDigestResponse, &other)),
        };
        SyncStats::add(&ctx.stats.digests_received, response.digests.len() as u64);

        let mut report = SyncReport::default();
        PeerSession::new(ctx, from.clone())
            .apply_digests(response.digests, &mut report)
            .await?;
        debug!(peer = %from, applied = report.applied, "Applied unsolicited digests");
        Ok(None)
    })
}

fn handle_favorite_op<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let op = match message {
            Message::FavoriteOp(op) => op,
            other => return Err(unexpected(MessageKind::FavoriteOp, &other)),
        };
        if !op.op_type.is_favorite() {
            return Err(CoreError::validation(format!(
                "{} op sent as FAVORITE_OP",
                op.op_type
            ))
            .into());
        }

        let outcome = ctx.replica.ingest_remote(op.clone(), None).await?;
        record_outcome(ctx, from, &op, &outcome);
        Ok(None)
    })
}

fn handle_favorite_sync_request<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let request = match message {
            Message::FavoriteSyncRequest(request) => request,
            other => return Err(unexpected(MessageKind::FavoriteSyncRequest, &other)),
        };
        SyncStats::incr(&ctx.stats.requests_received);

        let ops = ctx
            .replica
            .log()
            .favorite_ops_since(request.since_lamport, page_limit(&request));
        debug!(peer = %from, since = request.since_lamport, count = ops.len(), "Serving favorite page");
        Ok(Some(Message::FavoriteSyncResponse(FavoriteSyncResponse {
            request_id: request.request_id,
            ops,
        })))
    })
}

fn handle_favorite_sync_response<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let response = match message {
            Message::FavoriteSyncResponse(response) => response,
            other => return Err(unexpected(MessageKind::FavoriteSyncResponse, &other)),
        };
        let mut report = SyncReport::default();
        PeerSession::new(ctx, from.clone())
            .apply_favorite_ops(response.ops, &mut report)
            .await?;
        Ok(None)
    })
}

fn handle_report<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let report = match message {
            Message::Report(report) => report,
            other => return Err(unexpected(MessageKind::Report, &other)),
        };
        report.validate()?;
        let id = report.id.clone();
        if ctx.replica.ingest_report(report).await? {
            info!(peer = %from, report = %id, "Stored remote report");
        }
        Ok(None)
    })
}

fn handle_moderation_op<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let record = match message {
            Message::ModerationOp(record) => record,
            other => return Err(unexpected(MessageKind::ModerationOp, &other)),
        };
        let mut report = SyncReport::default();
        PeerSession::new(ctx, from.clone())
            .apply_moderation(vec![record], None, &mut report)
            .await?;
        Ok(None)
    })
}

fn handle_policy_update<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let policy = match message {
            Message::GovernancePolicyUpdate(policy) => policy,
            other => return Err(unexpected(MessageKind::GovernancePolicyUpdate, &other)),
        };
        let mut report = SyncReport::default();
        PeerSession::new(ctx, from.clone())
            .apply_moderation(Vec::new(), Some(policy), &mut report)
            .await?;
        Ok(None)
    })
}

fn handle_moderation_sync_request<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let request = match message {
            Message::ModerationSyncRequest(request) => request,
            other => return Err(unexpected(MessageKind::ModerationSyncRequest, &other)),
        };
        SyncStats::incr(&ctx.stats.requests_received);

        let moderation = ctx.replica.moderation();
        let records = moderation.records_since(request.since_lamport, page_limit(&request));
        debug!(peer = %from, since = request.since_lamport, count = records.len(), "Serving moderation page");
        Ok(Some(Message::ModerationSyncResponse(ModerationSyncResponse {
            request_id: request.request_id,
            records,
            policy: moderation.policy(),
        })))
    })
}

fn handle_moderation_sync_response<'a>(
    ctx: &'a NodeContext,
    from: &'a PeerId,
    message: Message,
) -> BoxFuture<'a, TransportResult<Option<Message>>> {
    Box::pin(async move {
        let response = match message {
            Message::ModerationSyncResponse(response) => response,
            other => return Err(unexpected(MessageKind::ModerationSyncResponse, &other)),
        };
        let mut report = SyncReport::default();
        PeerSession::new(ctx, from.clone())
            .apply_moderation(response.records, response.policy, &mut report)
            .await?;
        Ok(None)
    })
}
