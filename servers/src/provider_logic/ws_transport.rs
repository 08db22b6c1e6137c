//! [`ChannelTransport`] over per-client websocket writer queues.
//!
//! Every client gets its own [`BufferPool`]. A buffer reserves its full
//! capacity from the pool until the socket writer has sent the frame, so a
//! client that stops reading runs out of buffers and its sends are deferred
//! instead of piling up in memory.

use bytes::Bytes;
use lib_session::transport::buffer_pool::BufferPool;
use lib_session::transport::{ChannelTransport, TransportBuffer, TransportError};
use lib_session::ChannelHandle;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Encoded frame on its way to a socket writer.
#[derive(Debug)]
pub struct OutboundFrame {
    pub bytes: Bytes,
    /// Pool bytes to give back once the frame is written.
    pub reserved: u64,
}

#[derive(Debug, Clone)]
pub struct ClientLink {
    sender: mpsc::UnboundedSender<OutboundFrame>,
    pool: BufferPool,
}

impl ClientLink {
    pub fn new(sender: mpsc::UnboundedSender<OutboundFrame>, pool: BufferPool) -> Self {
        Self { sender, pool }
    }
}

#[derive(Debug, Default)]
pub struct WsTransport {
    links: HashMap<ChannelHandle, ClientLink>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, channel: ChannelHandle, link: ClientLink) {
        if self.links.insert(channel, link).is_some() {
            log::warn!("{} re-attached, previous writer dropped", channel);
        }
    }

    /// Drops the writer queue. The socket task sees the queue close and
    /// disconnects the client.
    pub fn detach(&mut self, channel: ChannelHandle) -> bool {
        self.links.remove(&channel).is_some()
    }

    pub fn is_attached(&self, channel: ChannelHandle) -> bool {
        self.links.contains_key(&channel)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl ChannelTransport for WsTransport {
    fn get_buffer(&mut self, channel: ChannelHandle, max_size: usize) -> Option<TransportBuffer> {
        match self.links.get(&channel) {
            Some(link) => {
                if !link.pool.try_acquire(max_size as u64) {
                    log::debug!(
                        "{}: no buffer for {} bytes ({:.1}% of pool in flight)",
                        channel,
                        max_size,
                        link.pool.usage_percent()
                    );
                    return None;
                }
                Some(TransportBuffer::with_capacity(max_size))
            }
            // Let the submit report the closed channel.
            None => Some(TransportBuffer::with_capacity(max_size)),
        }
    }

    fn submit(&mut self, channel: ChannelHandle, buffer: TransportBuffer) -> Result<(), TransportError> {
        let Some(link) = self.links.get(&channel) else {
            return Err(TransportError::ChannelClosed(channel));
        };
        let frame = OutboundFrame {
            reserved: buffer.capacity() as u64,
            bytes: buffer.freeze(),
        };
        link.sender.send(frame).map_err(|err| {
            link.pool.release(err.0.reserved);
            TransportError::WriteFailed {
                channel,
                reason: "socket writer has stopped".to_string(),
            }
        })
    }

    fn release_buffer(&mut self, channel: ChannelHandle, buffer: TransportBuffer) {
        if let Some(link) = self.links.get(&channel) {
            link.pool.release(buffer.capacity() as u64);
        }
    }
}
