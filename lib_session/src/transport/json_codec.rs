//! # JSON Codec
//!
//! Text encoding used by the websocket provider and the tests. Status and
//! refresh messages are one JSON object each. A refresh part is a JSON header
//! line, a `\n`, then the raw part body.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use super::{CodecError, MessageCodec, PartHeader, RefreshMessage, StatusMessage, TransportBuffer};
use crate::core::tunnel::ClassOfService;
use crate::core::types::{DataState, Domain, StateCode, StreamId, StreamState};

/// Room left for the part header line, including the separator.
pub const PART_HEADER_RESERVE: usize = 192;

/// Encoder for the JSON wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }

    /// Decodes one outbound frame, as a peer would.
    pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame, CodecError> {
        let (header, body) = match bytes.iter().position(|b| *b == b'\n') {
            Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
            None => (bytes, &[][..]),
        };
        let mut frame: DecodedFrame =
            serde_json::from_slice(header).map_err(|e| CodecError::Malformed(e.to_string()))?;
        if let DecodedFrame::RefreshPart { body: slot, .. } = &mut frame {
            *slot = Bytes::copy_from_slice(body);
        }
        Ok(frame)
    }
}

impl MessageCodec for JsonCodec {
    fn part_header_reserve(&self) -> usize {
        PART_HEADER_RESERVE
    }

    fn encode_status(&self, buffer: &mut TransportBuffer, msg: &StatusMessage) -> Result<(), CodecError> {
        let frame = json!({
            "type": "status",
            "domain": msg.domain,
            "streamId": msg.stream_id,
            "streamState": msg.status.stream_state,
            "dataState": msg.status.data_state,
            "code": msg.status.code,
            "text": msg.status.render_text(msg.stream_id),
            "classOfService": msg.class_of_service,
        });
        buffer.put_slice(&serde_json::to_vec(&frame)?)
    }

    fn encode_refresh(&self, buffer: &mut TransportBuffer, msg: &RefreshMessage) -> Result<(), CodecError> {
        let frame = json!({
            "type": "refresh",
            "domain": msg.domain,
            "streamId": msg.stream_id,
            "name": msg.name,
            "serviceId": msg.service_id,
            "streamState": StreamState::Open,
            "dataState": DataState::Ok,
            "text": msg.text,
            "privateStream": msg.private_stream,
            "classOfService": msg.class_of_service,
        });
        buffer.put_slice(&serde_json::to_vec(&frame)?)
    }

    fn encode_refresh_part(
        &self,
        buffer: &mut TransportBuffer,
        header: &PartHeader,
        body: &[u8],
    ) -> Result<(), CodecError> {
        let frame = json!({
            "type": "refreshPart",
            "domain": header.domain,
            "streamId": header.stream_id,
            "partIndex": header.part_index,
            "clearCache": header.clear_cache,
            "refreshComplete": header.refresh_complete,
        });
        let mut head = serde_json::to_vec(&frame)?;
        head.push(b'\n');

        let needed = head.len() + body.len();
        if needed > buffer.remaining() {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: buffer.remaining(),
            });
        }
        buffer.put_slice(&head)?;
        buffer.put_slice(body)
    }
}

/// An outbound frame as decoded by a peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DecodedFrame {
    /// Status message.
    #[serde(rename_all = "camelCase")]
    Status {
        /// Domain of the stream, absent for unsupported domains.
        domain: Option<Domain>,
        /// Stream id.
        stream_id: StreamId,
        /// Reported stream state.
        stream_state: StreamState,
        /// Reported data state.
        data_state: DataState,
        /// Status code.
        code: StateCode,
        /// Rendered text.
        text: String,
        /// Expected class of service on a tunnel redirect.
        class_of_service: Option<ClassOfService>,
    },
    /// Single-part refresh.
    #[serde(rename_all = "camelCase")]
    Refresh {
        /// Domain of the stream.
        domain: Domain,
        /// Stream id.
        stream_id: StreamId,
        /// Echoed domain key.
        name: String,
        /// Service id, if any.
        service_id: Option<u16>,
        /// State text.
        text: String,
        /// Private-stream flag.
        private_stream: bool,
        /// Accepted class of service on a tunnel.
        class_of_service: Option<ClassOfService>,
    },
    /// One part of a paginated refresh.
    #[serde(rename_all = "camelCase")]
    RefreshPart {
        /// Domain of the stream.
        domain: Domain,
        /// Stream id.
        stream_id: StreamId,
        /// Zero-based part number.
        part_index: u32,
        /// Set on the first part.
        clear_cache: bool,
        /// Set on the last part.
        refresh_complete: bool,
        /// Raw part body.
        #[serde(skip)]
        body: Bytes,
    },
}

impl DecodedFrame {
    /// Domain of the frame's stream.
    pub fn domain(&self) -> Option<Domain> {
        match self {
            DecodedFrame::Status { domain, .. } => *domain,
            DecodedFrame::Refresh { domain, .. } | DecodedFrame::RefreshPart { domain, .. } => Some(*domain),
        }
    }

    /// Stream the frame belongs to.
    pub fn stream_id(&self) -> StreamId {
        match self {
            DecodedFrame::Status { stream_id, .. }
            | DecodedFrame::Refresh { stream_id, .. }
            | DecodedFrame::RefreshPart { stream_id, .. } => *stream_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reject_policy::{RejectReason, RejectReasonPolicy};

    #[test]
    fn test_status_frame_decodes() {
        let codec = JsonCodec::new();
        let mut buffer = TransportBuffer::with_capacity(1024);
        let msg = StatusMessage {
            domain: Some(Domain::Login),
            stream_id: 2,
            status: RejectReasonPolicy::classify(RejectReason::MaxRequestsReached),
            class_of_service: None,
        };
        codec.encode_status(&mut buffer, &msg).unwrap();

        match JsonCodec::decode_frame(buffer.as_bytes()).unwrap() {
            DecodedFrame::Status { domain, stream_id, stream_state, code, text, .. } => {
                assert_eq!(domain, Some(Domain::Login));
                assert_eq!(stream_id, 2);
                assert_eq!(stream_state, StreamState::ClosedRecover);
                assert_eq!(code, StateCode::TooManyItems);
                assert!(text.contains("stream id 2"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_part_frame_keeps_body() {
        let codec = JsonCodec::new();
        let mut buffer = TransportBuffer::with_capacity(PART_HEADER_RESERVE + 8);
        let header = PartHeader {
            domain: Domain::Dictionary,
            stream_id: 3,
            part_index: 0,
            clear_cache: true,
            refresh_complete: false,
        };
        codec.encode_refresh_part(&mut buffer, &header, b"a\nb").unwrap();

        let frame = JsonCodec::decode_frame(buffer.as_bytes()).unwrap();
        assert_eq!(frame.stream_id(), 3);
        match frame {
            DecodedFrame::RefreshPart { clear_cache, refresh_complete, body, .. } => {
                assert!(clear_cache);
                assert!(!refresh_complete);
                assert_eq!(body.as_ref(), b"a\nb");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_part_that_does_not_fit_writes_nothing() {
        let codec = JsonCodec::new();
        let mut buffer = TransportBuffer::with_capacity(32);
        let header = PartHeader {
            domain: Domain::Dictionary,
            stream_id: 3,
            part_index: 0,
            clear_cache: true,
            refresh_complete: true,
        };
        assert!(matches!(
            codec.encode_refresh_part(&mut buffer, &header, b"body"),
            Err(CodecError::BufferTooSmall { .. })
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            JsonCodec::decode_frame(b"not json"),
            Err(CodecError::Malformed(_))
        ));
    }
}
