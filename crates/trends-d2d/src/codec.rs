//! Data channel wire protocol
//!
//! Text frames carry JSON envelopes:
//! `{ "type": "...", "id": "...", "payload": {...}, "timestamp": ms }`.
//!
//! A `file-chunk-meta` envelope announces that the very next binary frame
//! is chunk `chunkIndex` of `transferId`. The pairing relies on the channel
//! being ordered and reliable; [`FrameDecoder`] enforces it.

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::warn;

use crate::transport::Frame;
use crate::types::now_millis;

/// Envelope payloads, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    Chat {
        text: String,
        #[serde(default)]
        sender_name: String,
    },
    #[serde(rename_all = "camelCase")]
    FileRequest {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        #[serde(default)]
        mime_type: String,
        total_chunks: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileAccept { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    FileReject { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    FileChunkMeta {
        transfer_id: String,
        chunk_index: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete {
        transfer_id: String,
        total_chunks: u32,
    },
    Typing {},
    Ping {},
}

/// Discriminant of [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Chat,
    FileRequest,
    FileAccept,
    FileReject,
    FileChunkMeta,
    FileComplete,
    Typing,
    Ping,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Chat { .. } => MessageKind::Chat,
            Self::FileRequest { .. } => MessageKind::FileRequest,
            Self::FileAccept { .. } => MessageKind::FileAccept,
            Self::FileReject { .. } => MessageKind::FileReject,
            Self::FileChunkMeta { .. } => MessageKind::FileChunkMeta,
            Self::FileComplete { .. } => MessageKind::FileComplete,
            Self::Typing {} => MessageKind::Typing,
            Self::Ping {} => MessageKind::Ping,
        }
    }
}

/// Envelope codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed envelope: {0}")]
    Malformed(&'static str),
}

/// One protocol message with its id and send time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub timestamp: u64,
    pub message: Message,
}

impl Envelope {
    /// Stamp a message with the current time
    pub fn new(id: impl Into<String>, message: Message) -> Self {
        Self {
            id: id.into(),
            timestamp: now_millis(),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String, CodecError> {
        let mut value = serde_json::to_value(&self.message)?;
        let obj = value
            .as_object_mut()
            .ok_or(CodecError::Malformed("message is not an object"))?;
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert("timestamp".into(), Value::from(self.timestamp));
        Ok(serde_json::to_string(&value)?)
    }

    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut value: Value = serde_json::from_str(text)?;
        let obj = value
            .as_object_mut()
            .ok_or(CodecError::Malformed("envelope is not an object"))?;
        let id = match obj.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(CodecError::Malformed("missing id")),
        };
        let timestamp = obj
            .remove("timestamp")
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        obj.entry("payload")
            .or_insert_with(|| Value::Object(Default::default()));
        let message = serde_json::from_value(value)?;
        Ok(Self {
            id,
            timestamp,
            message,
        })
    }
}

/// Chunk announced by a `file-chunk-meta` envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub transfer_id: String,
    pub chunk_index: u32,
}

/// Decoded inbound item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Envelope(Envelope),
    Chunk { meta: ChunkMeta, data: Bytes },
}

/// Framing violations. The offending frame is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("binary frame of {0} bytes without preceding chunk metadata")]
    UnexpectedBinary(usize),
    #[error("undecodable text frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FramingState {
    AwaitingFrame,
    AwaitingBinary(ChunkMeta),
}

/// Pairs `file-chunk-meta` envelopes with the binary frame that follows them
#[derive(Debug)]
pub struct FrameDecoder {
    state: FramingState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: FramingState::AwaitingFrame,
        }
    }

    /// A chunk header has been seen and its binary frame has not
    pub fn is_awaiting_binary(&self) -> bool {
        matches!(self.state, FramingState::AwaitingBinary(_))
    }

    /// Feed one frame. `Ok(None)` means the frame was consumed by framing.
    pub fn feed(&mut self, frame: Frame) -> Result<Option<Inbound>, FramingError> {
        match frame {
            Frame::Text(text) => {
                let envelope =
                    Envelope::decode(&text).map_err(|e| FramingError::Malformed(e.to_string()))?;
                if let Message::FileChunkMeta {
                    transfer_id,
                    chunk_index,
                } = &envelope.message
                {
                    let meta = ChunkMeta {
                        transfer_id: transfer_id.clone(),
                        chunk_index: *chunk_index,
                    };
                    if let FramingState::AwaitingBinary(previous) = &self.state {
                        warn!(
                            "chunk {} of {} never arrived, replaced by chunk {}",
                            previous.chunk_index, previous.transfer_id, meta.chunk_index
                        );
                    }
                    self.state = FramingState::AwaitingBinary(meta);
                    return Ok(None);
                }
                Ok(Some(Inbound::Envelope(envelope)))
            }
            Frame::Binary(data) => {
                match std::mem::replace(&mut self.state, FramingState::AwaitingFrame) {
                    FramingState::AwaitingBinary(meta) => Ok(Some(Inbound::Chunk { meta, data })),
                    FramingState::AwaitingFrame => Err(FramingError::UnexpectedBinary(data.len())),
                }
            }
        }
    }
}

/// Bounded memory of recently seen envelope ids
pub struct DedupWindow {
    seen: LruCache<String, ()>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Returns `true` the first time an id is observed within the window
    pub fn observe(&mut self, id: &str) -> bool {
        if self.seen.get(id).is_some() {
            return false;
        }
        self.seen.put(id.to_string(), ());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Envelope id generator: `{localId}_{sessionTag}_{counter}`
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(local_peer_id: &str) -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            prefix: format!("{}_{}", local_peer_id, &tag[..8]),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}", self.prefix, n)
    }
}

/// Id of the metadata envelope for one chunk
pub fn chunk_envelope_id(transfer_id: &str, chunk_index: u32) -> String {
    format!("chunk_{}_{}", transfer_id, chunk_index)
}

/// Id of the completion envelope of a transfer
pub fn complete_envelope_id(transfer_id: &str) -> String {
    format!("complete_{}", transfer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_frame(transfer_id: &str, chunk_index: u32) -> Frame {
        let env = Envelope::new(
            chunk_envelope_id(transfer_id, chunk_index),
            Message::FileChunkMeta {
                transfer_id: transfer_id.into(),
                chunk_index,
            },
        );
        Frame::Text(env.encode().unwrap())
    }

    #[test]
    fn test_encode_wire_shape() {
        let env = Envelope {
            id: "m1".into(),
            timestamp: 42,
            message: Message::FileRequest {
                transfer_id: "t1".into(),
                file_name: "a.bin".into(),
                file_size: 40000,
                mime_type: "application/octet-stream".into(),
                total_chunks: 3,
            },
        };
        let json: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "file-request");
        assert_eq!(json["id"], "m1");
        assert_eq!(json["timestamp"], 42);
        assert_eq!(json["payload"]["transferId"], "t1");
        assert_eq!(json["payload"]["fileSize"], 40000);
        assert_eq!(json["payload"]["totalChunks"], 3);
    }

    #[test]
    fn test_decode_accepts_missing_payload() {
        let env = Envelope::decode(r#"{"type":"typing","id":"x1"}"#).unwrap();
        assert_eq!(env.message, Message::Typing {});
        assert_eq!(env.timestamp, 0);

        let env = Envelope::decode(r#"{"type":"ping","id":"x2","payload":{},"timestamp":9}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::Ping);
        assert_eq!(env.timestamp, 9);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"type":"chat","payload":{"text":"hi"}}"#).is_err());
        assert!(Envelope::decode(r#"{"type":"teleport","id":"1","payload":{}}"#).is_err());
        assert!(Envelope::decode("[1,2]").is_err());
    }

    #[test]
    fn test_chat_roundtrip() {
        let env = Envelope::new(
            "alice_1",
            Message::Chat {
                text: "hello".into(),
                sender_name: "Alice".into(),
            },
        );
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_binary_follows_meta() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(meta_frame("t1", 0)).unwrap(), None);
        assert!(decoder.is_awaiting_binary());

        let out = decoder.feed(Frame::Binary(Bytes::from_static(b"abc"))).unwrap();
        match out {
            Some(Inbound::Chunk { meta, data }) => {
                assert_eq!(meta.transfer_id, "t1");
                assert_eq!(meta.chunk_index, 0);
                assert_eq!(&data[..], b"abc");
            }
            other => panic!("expected chunk, got {:?}", other),
        }
        assert!(!decoder.is_awaiting_binary());
    }

    #[test]
    fn test_binary_without_meta_is_violation() {
        let mut decoder = FrameDecoder::new();
        let err = decoder
            .feed(Frame::Binary(Bytes::from_static(b"orphan")))
            .unwrap_err();
        assert_eq!(err, FramingError::UnexpectedBinary(6));

        // A second binary after a consumed chunk is also orphaned
        decoder.feed(meta_frame("t1", 0)).unwrap();
        decoder.feed(Frame::Binary(Bytes::from_static(b"1"))).unwrap();
        assert!(decoder.feed(Frame::Binary(Bytes::from_static(b"2"))).is_err());
    }

    #[test]
    fn test_text_between_meta_and_binary_keeps_slot() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(meta_frame("t1", 4)).unwrap();
        let chat = Envelope::new(
            "c1",
            Message::Chat {
                text: "interleaved".into(),
                sender_name: String::new(),
            },
        );
        let out = decoder.feed(Frame::Text(chat.encode().unwrap())).unwrap();
        assert!(matches!(out, Some(Inbound::Envelope(_))));
        match decoder.feed(Frame::Binary(Bytes::from_static(b"x"))).unwrap() {
            Some(Inbound::Chunk { meta, .. }) => assert_eq!(meta.chunk_index, 4),
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_second_meta_replaces_first() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(meta_frame("t1", 0)).unwrap();
        decoder.feed(meta_frame("t1", 1)).unwrap();
        match decoder.feed(Frame::Binary(Bytes::from_static(b"x"))).unwrap() {
            Some(Inbound::Chunk { meta, .. }) => assert_eq!(meta.chunk_index, 1),
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_text_is_reported() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(Frame::Text("{".into())).unwrap_err();
        assert!(matches!(err, FramingError::Malformed(_)));
    }

    #[test]
    fn test_dedup_window() {
        let mut window = DedupWindow::new(2);
        assert!(window.observe("a"));
        assert!(!window.observe("a"));
        assert!(window.observe("b"));
        assert!(window.observe("c"));
        // "a" fell out of the window
        assert!(window.observe("a"));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_dedup_zero_capacity_still_dedups_last() {
        let mut window = DedupWindow::new(0);
        assert!(window.observe("a"));
        assert!(!window.observe("a"));
    }

    #[test]
    fn test_id_generator_unique() {
        let ids = IdGenerator::new("alice");
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("alice_"));
        assert!(a.ends_with("_1"));
        assert!(b.ends_with("_2"));
        assert_ne!(IdGenerator::new("alice").next_id(), a);
    }
}
