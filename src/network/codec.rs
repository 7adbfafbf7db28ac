//! Binary codec for arena datagrams.
//!
//! A datagram is a fixed 5-byte header followed by the kind-specific payload:
//!
//! ```text
//! +--------+-----------------+---------------------------+
//! | kind   | index (i32, LE) | payload (bincode)         |
//! | 1 byte | 4 bytes         | rest of the datagram      |
//! +--------+-----------------+---------------------------+
//! ```
//!
//! The payload uses bincode's standard config with fixed-width little-endian integers,
//! so host and client agree on the layout whatever their CPU. Decoding never panics;
//! anything that does not parse exactly is a [`CodecError`] and callers drop the packet.
//!
//! # Examples
//!
//! ```
//! use arena_sync::network::codec::{decode_message, encode_message};
//! use arena_sync::network::messages::{Message, MessageBody, MessageIndex};
//!
//! let msg = Message::new(MessageIndex::new(7), MessageBody::Heartbeat);
//! let bytes = encode_message(&msg).expect("encoding should succeed");
//! assert_eq!(bytes, [5, 7, 0, 0, 0]);
//! assert_eq!(decode_message(&bytes).expect("decoding should succeed"), msg);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::network::messages::{Message, MessageBody, MessageIndex, MessageKind};

/// Length of the `[kind][index]` header.
pub const HEADER_LEN: usize = 5;

// Fixed-size integers keep the payload layout independent of value magnitude.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a message payload.
    EncodeMessage,
    /// Decoding a message payload.
    DecodeMessage,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding network message"),
            Self::DecodeMessage => write!(f, "decoding network message"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode's own errors are opaque, so their text is kept as a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The payload could not be decoded.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The datagram is shorter than the header.
    Truncated {
        /// The datagram length.
        len: usize,
    },
    /// The kind byte has no matching message kind.
    UnknownKind {
        /// The offending tag.
        tag: u8,
    },
    /// The payload decoded but bytes were left over.
    TrailingBytes {
        /// The kind whose payload was decoded.
        kind: MessageKind,
        /// How many bytes were left.
        extra: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::Truncated { len } => {
                write!(
                    f,
                    "datagram of {len} bytes is shorter than the {HEADER_LEN}-byte header"
                )
            },
            Self::UnknownKind { tag } => write!(f, "unknown message kind {tag}"),
            Self::TrailingBytes { kind, extra } => {
                write!(f, "{extra} trailing bytes after {kind} payload")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value by appending to an existing `Vec<u8>`. Returns the bytes written.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeMessage))
}

/// Encodes a message into a datagram.
pub fn encode_message(msg: &Message) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(64);
    buffer.push(msg.kind().as_u8());
    buffer.extend_from_slice(&msg.index.as_i32().to_le_bytes());
    match &msg.body {
        MessageBody::SeekLobby
        | MessageBody::LeaveLobby
        | MessageBody::Heartbeat
        | MessageBody::DisbandLobby
        | MessageBody::ClientFinishedPlaying
        | MessageBody::HostFinishedPlaying
        | MessageBody::ClientFinishedResult
        | MessageBody::HostFinishedResult => 0,
        MessageBody::SeekLobbyReply(body) => encode_append(body, &mut buffer)?,
        MessageBody::JoinLobby(body) => encode_append(body, &mut buffer)?,
        MessageBody::Notice(body) => encode_append(body, &mut buffer)?,
        MessageBody::PlayerJoined(body) => encode_append(body, &mut buffer)?,
        MessageBody::PlayerLeft(body) => encode_append(body, &mut buffer)?,
        MessageBody::ClientRequestChart(body)
        | MessageBody::HostRequestChart(body)
        | MessageBody::CheckChartExist(body) => encode_append(body, &mut buffer)?,
        MessageBody::HostReadyStat(body) => encode_append(body, &mut buffer)?,
        MessageBody::HostStartPlaying(body) => encode_append(body, &mut buffer)?,
        MessageBody::ClientPlayInit(body) | MessageBody::ClientPlayData(body) => {
            encode_append(body, &mut buffer)?
        },
        MessageBody::HostPlayInit(body) | MessageBody::HostPlayData(body) => {
            encode_append(body, &mut buffer)?
        },
        MessageBody::ClientFinishedLoading(body) => encode_append(body, &mut buffer)?,
        MessageBody::HostFinishedLoading(body) => encode_append(body, &mut buffer)?,
        MessageBody::Ack(body) => encode_append(body, &mut buffer)?,
    };
    Ok(buffer)
}

/// Decodes a datagram into a message.
///
/// Fails on a short header, an unknown kind, an undecodable payload, or leftover bytes.
pub fn decode_message(bytes: &[u8]) -> CodecResult<Message> {
    let (&[tag, i0, i1, i2, i3], payload) = split_header(bytes)?;
    let kind = MessageKind::try_from(tag).map_err(|_| CodecError::UnknownKind { tag })?;
    let index = MessageIndex::new(i32::from_le_bytes([i0, i1, i2, i3]));

    let body = match kind {
        MessageKind::SeekLobby => unit(kind, payload, MessageBody::SeekLobby)?,
        MessageKind::LeaveLobby => unit(kind, payload, MessageBody::LeaveLobby)?,
        MessageKind::Heartbeat => unit(kind, payload, MessageBody::Heartbeat)?,
        MessageKind::DisbandLobby => unit(kind, payload, MessageBody::DisbandLobby)?,
        MessageKind::ClientFinishedPlaying => {
            unit(kind, payload, MessageBody::ClientFinishedPlaying)?
        },
        MessageKind::HostFinishedPlaying => unit(kind, payload, MessageBody::HostFinishedPlaying)?,
        MessageKind::ClientFinishedResult => {
            unit(kind, payload, MessageBody::ClientFinishedResult)?
        },
        MessageKind::HostFinishedResult => unit(kind, payload, MessageBody::HostFinishedResult)?,
        MessageKind::SeekLobbyReply => MessageBody::SeekLobbyReply(exact(kind, payload)?),
        MessageKind::JoinLobby => MessageBody::JoinLobby(exact(kind, payload)?),
        MessageKind::Notice => MessageBody::Notice(exact(kind, payload)?),
        MessageKind::PlayerJoined => MessageBody::PlayerJoined(exact(kind, payload)?),
        MessageKind::PlayerLeft => MessageBody::PlayerLeft(exact(kind, payload)?),
        MessageKind::ClientRequestChart => MessageBody::ClientRequestChart(exact(kind, payload)?),
        MessageKind::HostRequestChart => MessageBody::HostRequestChart(exact(kind, payload)?),
        MessageKind::CheckChartExist => MessageBody::CheckChartExist(exact(kind, payload)?),
        MessageKind::HostReadyStat => MessageBody::HostReadyStat(exact(kind, payload)?),
        MessageKind::HostStartPlaying => MessageBody::HostStartPlaying(exact(kind, payload)?),
        MessageKind::ClientPlayInit => MessageBody::ClientPlayInit(exact(kind, payload)?),
        MessageKind::HostPlayInit => MessageBody::HostPlayInit(exact(kind, payload)?),
        MessageKind::ClientFinishedLoading => {
            MessageBody::ClientFinishedLoading(exact(kind, payload)?)
        },
        MessageKind::HostFinishedLoading => {
            MessageBody::HostFinishedLoading(exact(kind, payload)?)
        },
        MessageKind::ClientPlayData => MessageBody::ClientPlayData(exact(kind, payload)?),
        MessageKind::HostPlayData => MessageBody::HostPlayData(exact(kind, payload)?),
        MessageKind::Ack => MessageBody::Ack(exact(kind, payload)?),
    };
    Ok(Message { index, body })
}

/// Reads just the header, without decoding the payload.
pub fn peek_header(bytes: &[u8]) -> CodecResult<(MessageKind, MessageIndex)> {
    let (&[tag, i0, i1, i2, i3], _) = split_header(bytes)?;
    let kind = MessageKind::try_from(tag).map_err(|_| CodecError::UnknownKind { tag })?;
    Ok((kind, MessageIndex::new(i32::from_le_bytes([i0, i1, i2, i3]))))
}

fn split_header(bytes: &[u8]) -> CodecResult<(&[u8; HEADER_LEN], &[u8])> {
    bytes
        .split_first_chunk::<HEADER_LEN>()
        .ok_or(CodecError::Truncated { len: bytes.len() })
}

fn unit(kind: MessageKind, payload: &[u8], body: MessageBody) -> CodecResult<MessageBody> {
    if payload.is_empty() {
        Ok(body)
    } else {
        Err(CodecError::TrailingBytes {
            kind,
            extra: payload.len(),
        })
    }
}

fn exact<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> CodecResult<T> {
    let (value, used) = bincode::serde::decode_from_slice(payload, config())
        .map_err(|e| CodecError::decode(format!("{kind}: {e}"), CodecOperation::DecodeMessage))?;
    if used != payload.len() {
        return Err(CodecError::TrailingBytes {
            kind,
            extra: payload.len() - used,
        });
    }
    Ok(value)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{
        Ack, AckPayload, ChartProposal, ErrorCode, FinishedLoading, JoinRequest, LobbyRoster,
        Notice, NoticeKey, PlayRelay, PlayerInfo, ReadyStat, StartPlaying,
    };
    use crate::{ChartHash, ParticipantId};

    fn msg(index: i32, body: MessageBody) -> Message {
        Message::new(MessageIndex::new(index), body)
    }

    #[test]
    fn header_layout_is_kind_then_little_endian_index() {
        let bytes = encode_message(&msg(0x0102_0304, MessageBody::LeaveLobby)).unwrap();
        assert_eq!(bytes, [4, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn negative_indices_survive() {
        let original = msg(-5, MessageBody::Heartbeat);
        let bytes = encode_message(&original).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), original);
    }

    #[test]
    fn rich_payloads_round_trip() {
        let cases = vec![
            msg(
                1,
                MessageBody::JoinLobby(JoinRequest {
                    name: "rin".into(),
                    version: "1.4.2".into(),
                }),
            ),
            msg(
                2,
                MessageBody::Ack(Ack {
                    req_kind: MessageKind::JoinLobby,
                    error: ErrorCode::Ok,
                    payload: AckPayload::Roster(LobbyRoster {
                        your_id: ParticipantId::new(2),
                        members: vec![
                            PlayerInfo {
                                id: ParticipantId::HOST,
                                name: "host".into(),
                            },
                            PlayerInfo {
                                id: ParticipantId::new(2),
                                name: "rin".into(),
                            },
                        ],
                    }),
                }),
            ),
            msg(
                3,
                MessageBody::Ack(Ack {
                    req_kind: MessageKind::CheckChartExist,
                    error: ErrorCode::Ok,
                    payload: AckPayload::ChartExist { exist: false },
                }),
            ),
            msg(
                4,
                MessageBody::HostStartPlaying(StartPlaying {
                    seed: u64::MAX,
                    chart: ChartHash::new("abc123"),
                }),
            ),
            msg(
                5,
                MessageBody::HostReadyStat(ReadyStat {
                    ready: vec![(ParticipantId::HOST, true), (ParticipantId::new(1), false)],
                }),
            ),
            msg(
                6,
                MessageBody::HostPlayData(PlayRelay {
                    entries: vec![(ParticipantId::new(1), vec![9, 8, 7])],
                }),
            ),
            msg(
                7,
                MessageBody::Notice(Notice::with_text(NoticeKey::PeerLacksChart, "mika")),
            ),
            msg(
                8,
                MessageBody::ClientFinishedLoading(FinishedLoading {
                    start_offset_ms: 1_500,
                }),
            ),
            msg(
                9,
                MessageBody::HostRequestChart(ChartProposal {
                    chart: ChartHash::empty(),
                }),
            ),
        ];

        for original in cases {
            let bytes = encode_message(&original).unwrap();
            assert_eq!(decode_message(&bytes).unwrap(), original);
        }
    }

    #[test]
    fn short_buffers_are_truncated() {
        for len in 0..HEADER_LEN {
            let bytes = vec![5u8; len];
            assert_eq!(decode_message(&bytes), Err(CodecError::Truncated { len }));
        }
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert_eq!(
            decode_message(&[0, 0, 0, 0, 0]),
            Err(CodecError::UnknownKind { tag: 0 })
        );
        assert_eq!(
            decode_message(&[200, 0, 0, 0, 0]),
            Err(CodecError::UnknownKind { tag: 200 })
        );
    }

    #[test]
    fn trailing_bytes_after_unit_body_are_rejected() {
        let result = decode_message(&[5, 1, 0, 0, 0, 0xAA]);
        assert_eq!(
            result,
            Err(CodecError::TrailingBytes {
                kind: MessageKind::Heartbeat,
                extra: 1
            })
        );
    }

    #[test]
    fn trailing_bytes_after_payload_are_rejected() {
        let mut bytes = encode_message(&msg(
            1,
            MessageBody::PlayerLeft(crate::network::messages::PlayerLeft {
                id: ParticipantId::new(3),
            }),
        ))
        .unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_message(&bytes),
            Err(CodecError::TrailingBytes { extra: 1, .. })
        ));
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let bytes = encode_message(&msg(
            1,
            MessageBody::HostStartPlaying(StartPlaying {
                seed: 7,
                chart: ChartHash::new("deadbeef"),
            }),
        ))
        .unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode_message(cut),
            Err(CodecError::DecodeError { .. })
        ));
    }

    #[test]
    fn invalid_error_code_is_a_decode_error() {
        let mut bytes = encode_message(&msg(
            1,
            MessageBody::Ack(Ack::rejected(MessageKind::JoinLobby, ErrorCode::LobbyFull)),
        ))
        .unwrap();
        // [header][req_kind][error]...
        bytes[HEADER_LEN + 1] = 99;
        assert!(matches!(
            decode_message(&bytes),
            Err(CodecError::DecodeError { .. })
        ));
    }

    #[test]
    fn peek_header_reads_without_payload() {
        let bytes = encode_message(&msg(
            42,
            MessageBody::CheckChartExist(ChartProposal {
                chart: ChartHash::new("x"),
            }),
        ))
        .unwrap();
        assert_eq!(
            peek_header(&bytes[..HEADER_LEN]).unwrap(),
            (MessageKind::CheckChartExist, MessageIndex::new(42))
        );
    }

    #[test]
    fn encoding_is_deterministic() {
        let original = msg(
            11,
            MessageBody::HostReadyStat(ReadyStat {
                ready: vec![(ParticipantId::HOST, true)],
            }),
        );
        assert_eq!(
            encode_message(&original).unwrap(),
            encode_message(&original).unwrap()
        );
    }

    #[test]
    fn codec_error_display() {
        assert!(CodecError::Truncated { len: 2 }
            .to_string()
            .contains("shorter than the 5-byte header"));
        assert!(CodecError::UnknownKind { tag: 77 }.to_string().contains("77"));
        let err = CodecError::decode("boom", CodecOperation::DecodeMessage);
        assert!(err.to_string().contains("decoding network message"));
    }

    #[test]
    fn encode_append_keeps_existing_bytes() {
        let mut buffer = vec![9, 9];
        let written = encode_append(&12345_u32, &mut buffer).unwrap();
        assert_eq!(written, 4);
        assert_eq!(buffer, [9, 9, 0x39, 0x30, 0, 0]);
    }
}
