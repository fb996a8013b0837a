//! EasyShare wire protocol implementation.
//!
//! Messages travel over TCP as length-prefixed frames:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                EasyShare Frame               │
//! ├───────────────┬────────────┬─────────────────┤
//! │ Payload length│  Type code │     Payload     │
//! │ 4 bytes (BE)  │   1 byte   │  UTF-8 JSON     │
//! └───────────────┴────────────┴─────────────────┘
//! ```
//!
//! The type code duplicates the JSON `type` tag and is informational:
//! dispatch reads the JSON. Binary payloads (file chunks) are base64-encoded
//! inside the JSON. The payload is capped at 10 MiB; an oversized frame is a
//! protocol error and tears the connection down.

use serde::{Deserialize, Serialize};

use crate::device::{epoch_millis, DeviceInfo};
use crate::error::{Error, Result};
use crate::MAX_PAYLOAD_SIZE;

/// Frame header size: 4-byte length + 1-byte type code.
pub const HEADER_SIZE: usize = 5;

/// An on-wire message: envelope fields plus a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id (8 random bytes, URL-safe base64)
    pub id: String,
    /// Emission time (epoch-ms)
    pub timestamp: i64,
    /// Typed payload
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            id: crate::crypto::generate_message_id(),
            timestamp: epoch_millis(),
            payload,
        }
    }

    /// Create a `pong` echoing the given ping id.
    #[must_use]
    pub fn pong(ping_id: String) -> Self {
        Self {
            id: ping_id,
            timestamp: epoch_millis(),
            payload: Payload::Pong,
        }
    }
}

/// Message payload variants.
///
/// The JSON tag is the snake_case variant name; payload fields use
/// camelCase, matching the existing clients on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Payload {
    /// Keepalive probe
    Ping,
    /// Keepalive reply (echoes the ping id in the envelope)
    Pong,
    /// Open a pairing exchange
    PairRequest {
        /// Initiator identity
        device_info: DeviceInfo,
    },
    /// Responder's random challenge
    PairChallenge {
        /// 32 random bytes, base64
        challenge: String,
        /// Challenge creation time (epoch-ms)
        timestamp: i64,
    },
    /// Initiator's proof of secret possession
    PairResponse {
        /// First 32 bytes of `hash(challenge ‖ secret)`, base64
        response: String,
        /// Initiator identity
        device_info: DeviceInfo,
    },
    /// Responder accepted the proof
    PairConfirm {
        /// Responder identity
        device_info: DeviceInfo,
    },
    /// Pairing refused or proof failed
    PairReject {
        /// Human-readable reason
        reason: String,
    },
    /// Text message
    Text {
        /// Message content (AEAD envelope in base64 when a session secret
        /// is established, plaintext otherwise)
        content: String,
    },
    /// Offer a file
    FileRequest {
        /// File name (no path components)
        file_name: String,
        /// File size in bytes
        file_size: u64,
        /// MIME type
        mime_type: String,
        /// Truncated-hash checksum (base64) or `size:<N>` tag
        checksum: String,
        /// Download URL when the sender serves the file over HTTP
        #[serde(skip_serializing_if = "Option::is_none", default)]
        http_url: Option<String>,
    },
    /// Accept a file offer
    FileAccept {
        /// Id of the `file_request` message
        request_id: String,
        /// Upload URL when the receiver accepts via HTTP upload
        #[serde(skip_serializing_if = "Option::is_none", default)]
        upload_url: Option<String>,
    },
    /// Refuse a file offer
    FileReject {
        /// Id of the `file_request` message
        request_id: String,
        /// Human-readable reason
        reason: String,
    },
    /// One 64 KiB slice of a chunk-mode transfer
    FileChunk {
        /// Id of the `file_request` message
        request_id: String,
        /// Zero-based chunk index
        chunk_index: u64,
        /// Total chunk count for the file
        total_chunks: u64,
        /// Chunk bytes, base64 (AEAD envelope when encrypted)
        data: String,
    },
    /// All chunks sent
    FileComplete {
        /// Id of the `file_request` message
        request_id: String,
        /// Full-file checksum for verification
        checksum: String,
    },
    /// Terminal receipt for HTTP-mode transfers
    FileAck {
        /// Id of the `file_request` message
        request_id: String,
        /// Whether the receiver verified and saved the file
        success: bool,
    },
    /// Error report
    Error {
        /// Error code (see [`crate::error::ErrorKind`])
        code: String,
        /// Human-readable message
        message: String,
        /// Id of the message that triggered the error
        #[serde(skip_serializing_if = "Option::is_none", default)]
        original_message_id: Option<String>,
    },
    /// Unrecognized message type; ignored for forward compatibility
    #[serde(other)]
    Unknown,
}

impl Payload {
    /// The informational type code carried in the frame header.
    #[must_use]
    pub const fn type_code(&self) -> u8 {
        match self {
            Self::Ping => 0x01,
            Self::Pong => 0x02,
            Self::PairRequest { .. } => 0x10,
            Self::PairChallenge { .. } => 0x11,
            Self::PairResponse { .. } => 0x12,
            Self::PairConfirm { .. } => 0x13,
            Self::PairReject { .. } => 0x14,
            Self::Text { .. } => 0x20,
            Self::FileRequest { .. } => 0x30,
            Self::FileAccept { .. } => 0x31,
            Self::FileReject { .. } => 0x32,
            Self::FileChunk { .. } => 0x33,
            Self::FileComplete { .. } => 0x34,
            Self::FileAck { .. } => 0x35,
            Self::Error { .. } => 0xFF,
            Self::Unknown => 0x00,
        }
    }

    /// Short name for logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::PairRequest { .. } => "pair_request",
            Self::PairChallenge { .. } => "pair_challenge",
            Self::PairResponse { .. } => "pair_response",
            Self::PairConfirm { .. } => "pair_confirm",
            Self::PairReject { .. } => "pair_reject",
            Self::Text { .. } => "text",
            Self::FileRequest { .. } => "file_request",
            Self::FileAccept { .. } => "file_accept",
            Self::FileReject { .. } => "file_reject",
            Self::FileChunk { .. } => "file_chunk",
            Self::FileComplete { .. } => "file_complete",
            Self::FileAck { .. } => "file_ack",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Encode a message into a wire frame.
///
/// # Errors
///
/// Returns [`Error::FrameTooLarge`] if the serialized payload exceeds the
/// 10 MiB limit, or a serialization error.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let payload =
        serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))?;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.push(message.payload.type_code());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// The single serialized write path for a peer socket.
///
/// Every outbound message goes through [`FrameWriter::send`], which
/// silently no-ops once the underlying socket is gone: a write failure is
/// logged and treated as a broken pipe, never propagated into other
/// handlers.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    broken: bool,
}

impl<W: tokio::io::AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a write half.
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            broken: false,
        }
    }

    /// Whether a previous write failed.
    #[must_use]
    pub const fn is_broken(&self) -> bool {
        self.broken
    }

    /// Access the underlying writer (used by tests to inspect frames).
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Frame and write a message, honoring backpressure.
    pub async fn send(&mut self, message: &Message) {
        if self.broken {
            return;
        }
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(kind = message.payload.name(), "failed to encode frame: {e}");
                return;
            }
        };
        if let Err(e) = self.write_all(&frame).await {
            tracing::warn!(kind = message.payload.name(), "socket write failed: {e}");
            self.broken = true;
        }
    }

    async fn write_all(&mut self, frame: &[u8]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }
}

/// Incremental frame parser.
///
/// Byte slices of arbitrary length are appended as they arrive from the
/// socket; [`MessageBuffer::drain`] extracts the longest possible prefix of
/// whole frames and leaves the tail for the next append.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the socket.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently held (for staleness diagnostics and tests).
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extract every complete frame currently buffered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] when a frame announces a payload
    /// over the limit, or [`Error::ProtocolError`] on malformed JSON. Both
    /// are protocol errors: the caller tears the connection down, so the
    /// offending bytes are discarded, not retried.
    pub fn drain(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        let mut consumed = 0usize;

        loop {
            let remaining = &self.buf[consumed..];
            if remaining.len() < HEADER_SIZE {
                break;
            }

            let payload_len =
                u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                    as usize;
            if payload_len > MAX_PAYLOAD_SIZE {
                self.buf.clear();
                return Err(Error::FrameTooLarge(payload_len));
            }
            if remaining.len() < HEADER_SIZE + payload_len {
                break;
            }

            let payload = &remaining[HEADER_SIZE..HEADER_SIZE + payload_len];
            consumed += HEADER_SIZE + payload_len;

            match serde_json::from_slice::<Message>(payload) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    self.buf.drain(..consumed);
                    return Err(Error::ProtocolError(format!("malformed frame JSON: {e}")));
                }
            }
        }

        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;

    fn device() -> DeviceInfo {
        DeviceInfo {
            id: "q7bGx0aZbUKOmnIs7vJcSQ".to_string(),
            name: "Study Desktop".to_string(),
            platform: Platform::Desktop,
            version: "1.0.0".to_string(),
            host: None,
            port: Some(49301),
        }
    }

    #[test]
    fn test_frame_roundtrip_all_variants() {
        let payloads = vec![
            Payload::Ping,
            Payload::Pong,
            Payload::PairRequest {
                device_info: device(),
            },
            Payload::PairChallenge {
                challenge: "Y2hhbGxlbmdl".to_string(),
                timestamp: 1_720_000_000_000,
            },
            Payload::PairResponse {
                response: "cmVzcG9uc2U".to_string(),
                device_info: device(),
            },
            Payload::PairConfirm {
                device_info: device(),
            },
            Payload::PairReject {
                reason: "Passphrase mismatch".to_string(),
            },
            Payload::Text {
                content: "hello".to_string(),
            },
            Payload::FileRequest {
                file_name: "photo.jpg".to_string(),
                file_size: 262_145,
                mime_type: "image/jpeg".to_string(),
                checksum: "u3+qbEXW0K4xEbFdIFGK3A==".to_string(),
                http_url: None,
            },
            Payload::FileAccept {
                request_id: "req1".to_string(),
                upload_url: Some("http://192.168.1.5:49400/upload/tok".to_string()),
            },
            Payload::FileReject {
                request_id: "req1".to_string(),
                reason: "declined".to_string(),
            },
            Payload::FileChunk {
                request_id: "req1".to_string(),
                chunk_index: 4,
                total_chunks: 5,
                data: "AQIDBA==".to_string(),
            },
            Payload::FileComplete {
                request_id: "req1".to_string(),
                checksum: "u3+qbEXW0K4xEbFdIFGK3A==".to_string(),
            },
            Payload::FileAck {
                request_id: "req1".to_string(),
                success: true,
            },
            Payload::Error {
                code: "protocol".to_string(),
                message: "oversized frame".to_string(),
                original_message_id: None,
            },
        ];

        for payload in payloads {
            let message = Message::new(payload);
            let frame = encode_frame(&message).expect("encode");

            let mut buffer = MessageBuffer::new();
            buffer.append(&frame);
            let drained = buffer.drain().expect("drain");

            assert_eq!(drained.len(), 1);
            assert_eq!(drained[0], message);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_wire_json_shape() {
        let message = Message::new(Payload::FileRequest {
            file_name: "doc.pdf".to_string(),
            file_size: 1024,
            mime_type: "application/pdf".to_string(),
            checksum: "size:1024".to_string(),
            http_url: None,
        });
        let json = serde_json::to_value(&message).expect("serialize");

        assert_eq!(json["type"], "file_request");
        assert_eq!(json["payload"]["fileName"], "doc.pdf");
        assert_eq!(json["payload"]["fileSize"], 1024);
        assert!(json["payload"].get("httpUrl").is_none());
        assert!(json.get("id").is_some());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_arbitrary_split_reassembly() {
        let messages: Vec<Message> = (0..8)
            .map(|i| {
                Message::new(Payload::Text {
                    content: format!("message number {i}"),
                })
            })
            .collect();

        let mut wire = Vec::new();
        for message in &messages {
            wire.extend_from_slice(&encode_frame(message).expect("encode"));
        }

        // Feed the byte stream in awkward slices.
        for split in [1usize, 3, 7, 16, 61, 255] {
            let mut buffer = MessageBuffer::new();
            let mut parsed = Vec::new();
            for piece in wire.chunks(split) {
                buffer.append(piece);
                parsed.extend(buffer.drain().expect("drain"));
            }
            assert_eq!(parsed, messages, "split size {split}");
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_left_in_buffer() {
        let message = Message::new(Payload::Ping);
        let frame = encode_frame(&message).expect("encode");

        let mut buffer = MessageBuffer::new();
        buffer.append(&frame[..frame.len() - 1]);
        assert!(buffer.drain().expect("drain").is_empty());
        assert_eq!(buffer.len(), frame.len() - 1);

        buffer.append(&frame[frame.len() - 1..]);
        let drained = buffer.drain().expect("drain");
        assert_eq!(drained, vec![message]);
    }

    #[test]
    fn test_frame_at_limit_accepted() {
        let mut buffer = MessageBuffer::new();
        let mut frame = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(MAX_PAYLOAD_SIZE as u32).to_be_bytes());
        frame.push(0x20);
        // Header alone: announced length is legal, bytes just haven't arrived.
        buffer.append(&frame);
        assert!(buffer.drain().expect("drain").is_empty());
    }

    #[test]
    fn test_frame_over_limit_rejected() {
        let mut buffer = MessageBuffer::new();
        let mut frame = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&((MAX_PAYLOAD_SIZE + 1) as u32).to_be_bytes());
        frame.push(0x20);
        buffer.append(&frame);

        assert!(matches!(buffer.drain(), Err(Error::FrameTooLarge(_))));
        assert!(buffer.is_empty(), "oversized stream is discarded");
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let garbage = b"{\"type\": oops";
        let mut frame = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        frame.push(0x20);
        frame.extend_from_slice(garbage);

        let mut buffer = MessageBuffer::new();
        buffer.append(&frame);
        assert!(matches!(buffer.drain(), Err(Error::ProtocolError(_))));
        assert!(buffer.is_empty(), "bad frame bytes are discarded");
    }

    #[test]
    fn test_unknown_type_parses_to_unknown() {
        let json = br#"{"id":"abc","timestamp":1720000000000,"type":"video_call","payload":{"x":1}}"#;
        let mut frame = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
        frame.push(0x7E);
        frame.extend_from_slice(json);

        let mut buffer = MessageBuffer::new();
        buffer.append(&frame);
        let drained = buffer.drain().expect("drain");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, Payload::Unknown);
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(Payload::Ping.type_code(), 0x01);
        assert_eq!(Payload::Pong.type_code(), 0x02);
        assert_eq!(
            Payload::PairRequest {
                device_info: device()
            }
            .type_code(),
            0x10
        );
        assert_eq!(
            Payload::Text {
                content: String::new()
            }
            .type_code(),
            0x20
        );
        assert_eq!(
            Payload::FileChunk {
                request_id: String::new(),
                chunk_index: 0,
                total_chunks: 0,
                data: String::new()
            }
            .type_code(),
            0x33
        );
        assert_eq!(
            Payload::Error {
                code: String::new(),
                message: String::new(),
                original_message_id: None
            }
            .type_code(),
            0xFF
        );
    }

    #[test]
    fn test_pong_echoes_ping_id() {
        let ping = Message::new(Payload::Ping);
        let pong = Message::pong(ping.id.clone());
        assert_eq!(pong.id, ping.id);
        assert_eq!(pong.payload, Payload::Pong);
    }
}
