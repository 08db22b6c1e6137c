//! # Loopback Transport
//!
//! In-memory [`ChannelTransport`] that records every submitted frame per
//! channel. Used by tests and by tooling that drives the coordinator without
//! sockets. Buffer exhaustion and write failures can be injected to exercise
//! the abort paths.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use super::buffer_pool::BufferPool;
use super::{ChannelTransport, TransportBuffer, TransportError};
use crate::core::types::ChannelHandle;

const DEFAULT_POOL_BYTES: u64 = 64 * 1024 * 1024;

/// Recording transport with fault injection.
#[derive(Debug)]
pub struct LoopbackTransport {
    pool: BufferPool,
    frames: HashMap<ChannelHandle, Vec<Bytes>>,
    buffers_lent: usize,
    deny_buffers_after: Option<usize>,
    submits: usize,
    fail_submits_after: Option<usize>,
    failed_channels: HashSet<ChannelHandle>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Loopback with a generous pool and no faults.
    pub fn new() -> Self {
        Self::with_pool(BufferPool::new(DEFAULT_POOL_BYTES))
    }

    /// Loopback drawing buffers from `pool`.
    pub fn with_pool(pool: BufferPool) -> Self {
        Self {
            pool,
            frames: HashMap::new(),
            buffers_lent: 0,
            deny_buffers_after: None,
            submits: 0,
            fail_submits_after: None,
            failed_channels: HashSet::new(),
        }
    }

    /// After `n` more buffers have been lent, `get_buffer` returns `None`.
    pub fn deny_buffers_after(&mut self, n: usize) {
        self.deny_buffers_after = Some(self.buffers_lent + n);
    }

    /// Lifts a previous [`deny_buffers_after`](Self::deny_buffers_after).
    pub fn allow_buffers(&mut self) {
        self.deny_buffers_after = None;
    }

    /// After `n` more successful submits, every submit fails.
    pub fn fail_submits_after(&mut self, n: usize) {
        self.fail_submits_after = Some(self.submits + n);
    }

    /// Every submit to `channel` fails from now on.
    pub fn fail_channel(&mut self, channel: ChannelHandle) {
        self.failed_channels.insert(channel);
    }

    /// Frames recorded for `channel`, oldest first.
    pub fn frames(&self, channel: ChannelHandle) -> &[Bytes] {
        self.frames.get(&channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Removes and returns the frames recorded for `channel`.
    pub fn take_frames(&mut self, channel: ChannelHandle) -> Vec<Bytes> {
        self.frames.remove(&channel).unwrap_or_default()
    }

    /// Frames recorded across every channel.
    pub fn total_frames(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    /// Pool the buffers are drawn from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl ChannelTransport for LoopbackTransport {
    fn get_buffer(&mut self, channel: ChannelHandle, max_size: usize) -> Option<TransportBuffer> {
        if self.deny_buffers_after.is_some_and(|limit| self.buffers_lent >= limit) {
            log::debug!("loopback: denying buffer for {}", channel);
            return None;
        }
        if !self.pool.try_acquire(max_size as u64) {
            log::debug!("loopback: pool exhausted for {} ({} bytes)", channel, max_size);
            return None;
        }
        self.buffers_lent += 1;
        Some(TransportBuffer::with_capacity(max_size))
    }

    fn submit(&mut self, channel: ChannelHandle, buffer: TransportBuffer) -> Result<(), TransportError> {
        self.pool.release(buffer.capacity() as u64);

        let over_limit = self.fail_submits_after.is_some_and(|limit| self.submits >= limit);
        if over_limit || self.failed_channels.contains(&channel) {
            return Err(TransportError::WriteFailed {
                channel,
                reason: "injected write failure".to_string(),
            });
        }

        self.submits += 1;
        self.frames.entry(channel).or_default().push(buffer.freeze());
        Ok(())
    }

    fn release_buffer(&mut self, _channel: ChannelHandle, buffer: TransportBuffer) {
        self.pool.release(buffer.capacity() as u64);
    }
}
