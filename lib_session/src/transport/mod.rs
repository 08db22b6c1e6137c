//! # Transport and Codec Seams
//!
//! The session core never touches sockets or wire bytes directly. It borrows
//! size-bounded [`TransportBuffer`]s from a [`ChannelTransport`], has a
//! [`MessageCodec`] fill them, and submits them back. Both traits are small so
//! that a loopback transport and a JSON codec can stand in during tests.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

use crate::core::tunnel::ClassOfService;
use crate::core::types::{ChannelHandle, Domain, StreamId, WireStatus};

pub mod buffer_pool;
pub mod json_codec;
pub mod loopback;

/// Failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel is not (or no longer) known to the transport.
    #[error("channel {0} is not connected")]
    ChannelClosed(ChannelHandle),
    /// The transport refused the write.
    #[error("write to {channel} failed: {reason}")]
    WriteFailed {
        /// Channel the write targeted.
        channel: ChannelHandle,
        /// Transport-specific description.
        reason: String,
    },
}

/// Failure while encoding into a transport buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The encoded message does not fit the buffer.
    #[error("buffer too small: need {needed} bytes, {available} available")]
    BufferTooSmall {
        /// Bytes the write required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },
    /// A single payload entry is larger than one part can hold.
    #[error("payload entry of {size} bytes exceeds part capacity {capacity}")]
    EntryTooLarge {
        /// Size of the entry.
        size: usize,
        /// Body capacity of one part.
        capacity: usize,
    },
    /// Serialization failed.
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Inbound bytes could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Serialize(err.to_string())
    }
}

/// # Transport Buffer
///
/// Write buffer with a hard upper bound fixed at acquisition time.
#[derive(Debug)]
pub struct TransportBuffer {
    data: BytesMut,
    capacity: usize,
}

impl TransportBuffer {
    /// Allocates an empty buffer bounded by `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Upper bound on the encoded size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes still writable.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Appends `bytes`, failing without writing if they do not fit.
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if bytes.len() > self.remaining() {
            return Err(CodecError::BufferTooSmall {
                needed: bytes.len(),
                available: self.remaining(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Encoded bytes so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the buffer into its encoded bytes.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

/// Per-channel write side of the transport.
pub trait ChannelTransport {
    /// Borrows a buffer of at most `max_size` bytes, or `None` when the
    /// transport has none to lend right now.
    fn get_buffer(&mut self, channel: ChannelHandle, max_size: usize) -> Option<TransportBuffer>;

    /// Queues a filled buffer for delivery. The buffer is consumed either way.
    fn submit(&mut self, channel: ChannelHandle, buffer: TransportBuffer) -> Result<(), TransportError>;

    /// Returns a buffer that will not be submitted.
    fn release_buffer(&mut self, channel: ChannelHandle, buffer: TransportBuffer);
}

/// Outbound status message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Domain of the stream; `None` when the peer used a domain this provider does not serve.
    pub domain: Option<Domain>,
    /// Stream the status applies to.
    pub stream_id: StreamId,
    /// Status tuple.
    pub status: WireStatus,
    /// Expected class of service, attached to tunnel redirects.
    pub class_of_service: Option<ClassOfService>,
}

/// Outbound single-part refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMessage {
    /// Domain of the stream.
    pub domain: Domain,
    /// Stream being refreshed.
    pub stream_id: StreamId,
    /// Domain key echoed back.
    pub name: String,
    /// Service the stream belongs to, where one applies.
    pub service_id: Option<u16>,
    /// Human-readable state text.
    pub text: String,
    /// Private-stream flag echoed back.
    pub private_stream: bool,
    /// Accepted class of service, for tunnel streams.
    pub class_of_service: Option<ClassOfService>,
}

/// Framing fields for one part of a paginated refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartHeader {
    /// Domain of the stream.
    pub domain: Domain,
    /// Stream being refreshed.
    pub stream_id: StreamId,
    /// Zero-based part number.
    pub part_index: u32,
    /// Set on the first part only.
    pub clear_cache: bool,
    /// Set on the last part only.
    pub refresh_complete: bool,
}

/// Message-to-bytes encoding.
pub trait MessageCodec {
    /// Bytes reserved in each part buffer for the part header.
    fn part_header_reserve(&self) -> usize;

    /// Encodes a status message.
    fn encode_status(&self, buffer: &mut TransportBuffer, msg: &StatusMessage) -> Result<(), CodecError>;

    /// Encodes a single-part refresh.
    fn encode_refresh(&self, buffer: &mut TransportBuffer, msg: &RefreshMessage) -> Result<(), CodecError>;

    /// Frames one part of a paginated refresh around an already encoded body.
    fn encode_refresh_part(
        &self,
        buffer: &mut TransportBuffer,
        header: &PartHeader,
        body: &[u8],
    ) -> Result<(), CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_bounded() {
        let mut buffer = TransportBuffer::with_capacity(4);
        buffer.put_slice(b"abc").unwrap();
        assert_eq!(buffer.remaining(), 1);
        assert_eq!(
            buffer.put_slice(b"de"),
            Err(CodecError::BufferTooSmall { needed: 2, available: 1 })
        );
        assert_eq!(buffer.as_bytes(), b"abc");
        buffer.put_slice(b"d").unwrap();
        assert_eq!(buffer.freeze().as_ref(), b"abcd");
    }
}
