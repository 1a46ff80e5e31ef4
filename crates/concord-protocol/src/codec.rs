//! Newline-delimited JSON framing

use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;
use bytes::{Bytes, BytesMut};

/// Maximum frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode a message as one frame, without the trailing newline
pub fn encode(message: &Message, timestamp: i64) -> ProtocolResult<Bytes> {
    let envelope = message.to_envelope(timestamp)?;
    let json = serde_json::to_vec(&envelope)?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(Bytes::from(json))
}

/// Decode one frame. Unrecognised tags decode to [`Message::Unknown`].
pub fn decode(frame: &[u8]) -> ProtocolResult<Message> {
    decode_with_limit(frame, MAX_FRAME_SIZE)
}

pub fn decode_with_limit(frame: &[u8], max: usize) -> ProtocolResult<Message> {
    if frame.len() > max {
        return Err(ProtocolError::MessageTooLarge {
            size: frame.len(),
            max,
        });
    }
    let envelope: Envelope = serde_json::from_slice(frame)?;
    if envelope.kind.trim().is_empty() {
        return Err(ProtocolError::MissingField("type".into()));
    }
    Message::from_envelope(envelope)
}

/// Splits a byte stream into newline-terminated frames
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame,
        }
    }

    /// Add data to the decoder buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to take one complete frame from the buffer.
    ///
    /// An oversized frame is discarded and reported as an error; the
    /// decoder stays usable for the frames after it.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Bytes>> {
        loop {
            let line_end = match self.buffer.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if self.buffer.len() > self.max_frame {
                        let size = self.buffer.len();
                        self.buffer.clear();
                        return Err(ProtocolError::MessageTooLarge {
                            size,
                            max: self.max_frame,
                        });
                    }
                    return Ok(None); // Incomplete
                }
            };

            let mut line = self.buffer.split_to(line_end + 1);
            line.truncate(line_end);
            if line.last() == Some(&b'\r') {
                line.truncate(line_end - 1);
            }

            if line.len() > self.max_frame {
                return Err(ProtocolError::MessageTooLarge {
                    size: line.len(),
                    max: self.max_frame,
                });
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return Ok(Some(line.freeze()));
        }
    }

    /// Bytes waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, SyncRequest};
    use concord_core::{ActorId, ContentId, EntityId, Op, OpType};

    fn digest_request() -> Message {
        Message::SyncDigestRequest(SyncRequest {
            request_id: "r1".into(),
            since_lamport: 4,
            limit: 200,
        })
    }

    #[test]
    fn test_encode_uses_envelope_shape() {
        let frame = encode(&digest_request(), 99).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();

        assert_eq!(value["type"], "SYNC_DIGEST_REQUEST");
        assert_eq!(value["payload"]["since_lamport"], 4);
        assert_eq!(value["timestamp"], 99);
        assert!(!frame.contains(&b'\n'));
    }

    #[test]
    fn test_decode_op_with_inline_content() {
        let op = Op::new(EntityId::from("p1"), OpType::Create, ActorId::from("alice"), 3, 10)
            .with_content(Some(ContentId::of(b"body")));
        let message = Message::Op(crate::message::OpPayload::new(op.clone(), Some(b"body")));

        let decoded = decode(&encode(&message, 0).unwrap()).unwrap();
        match decoded {
            Message::Op(payload) => {
                assert_eq!(payload.op, op);
                assert_eq!(payload.content_bytes().unwrap().unwrap(), b"body");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let decoded = decode(br#"{"type":"GOSSIP","payload":{},"timestamp":1}"#).unwrap();
        assert_eq!(decoded.kind(), MessageKind::Unknown);
        assert_eq!(decoded, Message::Unknown("GOSSIP".into()));
    }

    #[test]
    fn test_malformed_frames_fail() {
        assert!(decode(b"not json").is_err());
        assert!(decode(br#"{"payload":{}}"#).is_err());
        assert!(decode(br#"{"type":"OP","payload":{"op":{}}}"#).is_err());
        assert!(decode(br#"{"type":"OP"}"#).is_err());
        assert!(decode(br#"{"type":"OP","payload":{"op":null,"content":"zz"}}"#).is_err());
    }

    #[test]
    fn test_tags_are_case_insensitive() {
        assert_eq!(MessageKind::from_tag("favorite_op"), MessageKind::FavoriteOp);
        assert_eq!(MessageKind::from_tag("REPORT"), MessageKind::Report);
        assert_eq!(MessageKind::from_tag(""), MessageKind::Unknown);
    }

    #[test]
    fn test_moderation_frame_decodes() {
        let frame = br#"{"type":"MODERATION_OP","payload":{"target":"mallory","action":"SHADOW_BAN","admin":"root","lamport":9,"timestamp":5},"timestamp":1}"#;
        match decode(frame).unwrap() {
            Message::ModerationOp(record) => {
                assert_eq!(record.action, concord_core::ModerationAction::ShadowBan);
                assert_eq!(record.lamport, 9);
                assert!(record.reason.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(
            MessageKind::from_tag("governance_policy_update"),
            MessageKind::GovernancePolicyUpdate
        );
        assert!(MessageKind::ModerationSyncResponse.is_response());
    }

    #[test]
    fn test_frame_decoder_splits_lines() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"{\"a\":1}\r\n\n{\"b\":");

        assert_eq!(decoder.next_frame().unwrap().unwrap(), &b"{\"a\":1}"[..]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.feed(b"2}\n");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), &b"{\"b\":2}"[..]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_frame_decoder_drops_oversized_frames() {
        let mut decoder = FrameDecoder::with_max_frame(8);
        decoder.feed(b"0123456789abcdef\nok\n");

        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
        assert_eq!(decoder.next_frame().unwrap().unwrap(), &b"ok"[..]);

        decoder.feed(&[b'x'; 32]);
        assert!(decoder.next_frame().is_err());
        assert_eq!(decoder.pending(), 0);
    }
}
