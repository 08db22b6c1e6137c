//! # Multi-Part Response Encoder
//!
//! Splits a logical refresh that exceeds one transport buffer into an ordered
//! run of parts on the same stream. The first part carries `clear_cache`, the
//! last carries `refresh_complete`, and parts in between carry neither.
//!
//! ## Pacing
//!
//! [`MultiPartResponseEncoder::send_next_part`] emits exactly one part and
//! returns, so the coordinator can interleave long downloads with other work
//! by sending one part per tick. [`MultiPartResponseEncoder::send_paginated`]
//! drives a job to completion in one call.
//!
//! ## Failure
//!
//! Any failure aborts the job. Parts already submitted stay submitted; the
//! peer recovers by re-requesting the whole refresh.

use bytes::BytesMut;
use thiserror::Error;

use crate::transport::{
    ChannelTransport, CodecError, MessageCodec, PartHeader, RefreshMessage, StatusMessage,
    TransportBuffer, TransportError,
};
use crate::core::types::{ChannelHandle, Domain, StreamId};

/// Progress through one paginated refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiPartCursor {
    /// Size of the whole logical payload in bytes.
    pub total_logical_size: usize,
    /// Payload bytes already emitted.
    pub bytes_emitted: usize,
    /// Index of the next part to emit.
    pub part_index: u32,
    /// `true` until the first part is emitted.
    pub is_first_part: bool,
    /// `true` once the last part is emitted.
    pub is_complete: bool,
}

impl MultiPartCursor {
    /// Cursor positioned before the first part.
    pub fn new(total_logical_size: usize) -> Self {
        Self {
            total_logical_size,
            bytes_emitted: 0,
            part_index: 0,
            is_first_part: true,
            is_complete: false,
        }
    }

    /// Payload bytes not yet emitted.
    pub fn remaining(&self) -> usize {
        self.total_logical_size.saturating_sub(self.bytes_emitted)
    }

    fn advance(&mut self, body_bytes: usize, complete: bool) {
        self.bytes_emitted += body_bytes;
        self.part_index += 1;
        self.is_first_part = false;
        self.is_complete = complete;
    }
}

/// Whether a payload has more to emit after the part just encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    /// More parts follow.
    More,
    /// This part finishes the payload.
    Complete,
}

/// Produces the body of successive parts.
pub trait PayloadSource: Send {
    /// Size of the whole payload in bytes.
    fn total_size(&self) -> usize;

    /// Appends the next part's body to `out`, writing at most `limit` bytes.
    fn encode_part(
        &mut self,
        cursor: &MultiPartCursor,
        out: &mut BytesMut,
        limit: usize,
    ) -> Result<PartOutcome, CodecError>;
}

/// Why a message could not be sent. Carries the last underlying failure.
#[derive(Debug, Error)]
pub enum SendError {
    /// The transport had no buffer to lend.
    #[error("no buffer available on {channel} for {requested} bytes")]
    NoBuffer {
        /// Channel the buffer was requested for.
        channel: ChannelHandle,
        /// Requested size.
        requested: usize,
    },
    /// Encoding into the buffer failed.
    #[error("encode failed: {0}")]
    Encode(#[from] CodecError),
    /// The transport rejected the filled buffer.
    #[error("submit failed: {0}")]
    Submit(#[from] TransportError),
}

impl SendError {
    /// Buffer shortage clears up on its own; encode and submit failures do not.
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::NoBuffer { .. })
    }
}

/// Result of emitting one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSent {
    /// Index of the part just emitted.
    pub part_index: u32,
    /// Payload bytes in the part body.
    pub body_bytes: usize,
    /// `true` when this was the last part.
    pub complete: bool,
}

/// One paginated refresh in flight.
pub struct PaginatedSend {
    channel: ChannelHandle,
    domain: Domain,
    stream_id: StreamId,
    max_part_bytes: usize,
    cursor: MultiPartCursor,
    source: Box<dyn PayloadSource>,
}

impl std::fmt::Debug for PaginatedSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginatedSend")
            .field("channel", &self.channel)
            .field("domain", &self.domain)
            .field("stream_id", &self.stream_id)
            .field("max_part_bytes", &self.max_part_bytes)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl PaginatedSend {
    /// Prepares a job; nothing is sent until the encoder drives it.
    pub fn new(
        channel: ChannelHandle,
        domain: Domain,
        stream_id: StreamId,
        max_part_bytes: usize,
        source: Box<dyn PayloadSource>,
    ) -> Self {
        let cursor = MultiPartCursor::new(source.total_size());
        Self {
            channel,
            domain,
            stream_id,
            max_part_bytes,
            cursor,
            source,
        }
    }

    /// Destination channel.
    pub fn channel(&self) -> ChannelHandle {
        self.channel
    }

    /// Domain of the refreshed stream.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Refreshed stream.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Current progress.
    pub fn cursor(&self) -> &MultiPartCursor {
        &self.cursor
    }

    /// `true` once the last part went out.
    pub fn is_complete(&self) -> bool {
        self.cursor.is_complete
    }
}

/// Borrows a transport and a codec to put messages on the wire.
pub struct MultiPartResponseEncoder<'a, T, C> {
    transport: &'a mut T,
    codec: &'a C,
}

impl<'a, T: ChannelTransport, C: MessageCodec> MultiPartResponseEncoder<'a, T, C> {
    /// Wraps a transport and codec for the duration of a send.
    pub fn new(transport: &'a mut T, codec: &'a C) -> Self {
        Self { transport, codec }
    }

    /// Emits the next part of `send`.
    ///
    /// Calling this on a completed job emits nothing and reports completion.
    pub fn send_next_part(&mut self, send: &mut PaginatedSend) -> Result<PartSent, SendError> {
        if send.cursor.is_complete {
            return Ok(PartSent {
                part_index: send.cursor.part_index.saturating_sub(1),
                body_bytes: 0,
                complete: true,
            });
        }

        let channel = send.channel;
        let mut buffer = self
            .transport
            .get_buffer(channel, send.max_part_bytes)
            .ok_or(SendError::NoBuffer {
                channel,
                requested: send.max_part_bytes,
            })?;

        let reserve = self.codec.part_header_reserve();
        let limit = buffer.capacity().saturating_sub(reserve);
        if limit == 0 {
            let available = buffer.capacity();
            self.transport.release_buffer(channel, buffer);
            return Err(SendError::Encode(CodecError::BufferTooSmall {
                needed: reserve + 1,
                available,
            }));
        }

        let mut body = BytesMut::with_capacity(limit);
        let outcome = match send.source.encode_part(&send.cursor, &mut body, limit) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.transport.release_buffer(channel, buffer);
                return Err(err.into());
            }
        };
        let complete = outcome == PartOutcome::Complete;

        let header = PartHeader {
            domain: send.domain,
            stream_id: send.stream_id,
            part_index: send.cursor.part_index,
            clear_cache: send.cursor.is_first_part,
            refresh_complete: complete,
        };
        if let Err(err) = self.codec.encode_refresh_part(&mut buffer, &header, &body) {
            self.transport.release_buffer(channel, buffer);
            return Err(err.into());
        }
        self.transport.submit(channel, buffer)?;

        send.cursor.advance(body.len(), complete);
        log::trace!(
            "{} {} stream {}: part {} sent ({} bytes, complete={})",
            channel,
            send.domain,
            send.stream_id,
            header.part_index,
            body.len(),
            complete
        );

        Ok(PartSent {
            part_index: header.part_index,
            body_bytes: body.len(),
            complete,
        })
    }

    /// Emits every remaining part of `send`. Returns the number of parts sent
    /// by this call.
    pub fn send_paginated(&mut self, send: &mut PaginatedSend) -> Result<u32, SendError> {
        let mut parts = 0;
        while !send.is_complete() {
            self.send_next_part(send)?;
            parts += 1;
        }
        Ok(parts)
    }

    /// Sends a single status message.
    pub fn send_status(
        &mut self,
        channel: ChannelHandle,
        msg: &StatusMessage,
        max_size: usize,
    ) -> Result<(), SendError> {
        self.send_single(channel, max_size, |codec, buffer| codec.encode_status(buffer, msg))
    }

    /// Sends a single-part refresh.
    pub fn send_refresh(
        &mut self,
        channel: ChannelHandle,
        msg: &RefreshMessage,
        max_size: usize,
    ) -> Result<(), SendError> {
        self.send_single(channel, max_size, |codec, buffer| codec.encode_refresh(buffer, msg))
    }

    fn send_single<F>(&mut self, channel: ChannelHandle, max_size: usize, encode: F) -> Result<(), SendError>
    where
        F: FnOnce(&C, &mut TransportBuffer) -> Result<(), CodecError>,
    {
        let mut buffer = self
            .transport
            .get_buffer(channel, max_size)
            .ok_or(SendError::NoBuffer {
                channel,
                requested: max_size,
            })?;
        if let Err(err) = encode(self.codec, &mut buffer) {
            self.transport.release_buffer(channel, buffer);
            return Err(err.into());
        }
        self.transport.submit(channel, buffer)?;
        Ok(())
    }
}
