//! # Session Coordinator
//!
//! Single owner of every [`ChannelSession`]. The surrounding shell feeds it
//! channel lifecycle events, decoded domain messages and a periodic tick; the
//! coordinator answers through the [`ChannelTransport`] it owns.
//!
//! ## Responsibilities
//!
//! - **Lifecycle**: `Up`/`Ready` create a session, `Down` tears it down with a
//!   close status per open stream, `DownReconnecting` drops transient flags
//!   and queued sends but keeps the stream slots.
//! - **Requests**: accepted requests get a refresh; rejected ones get the
//!   classified status on the same stream id, and the channel stays open.
//! - **Pacing**: dictionary downloads are queued and advance one part per
//!   tick, so a large download never starves other channels.
//! - **Failure**: a buffer shortage defers the message to the next tick. An
//!   encode or submit failure removes the channel.
//! - **Run time**: once the configured run time elapses, every open stream
//!   gets a close status; the tick then reports [`TickOutcome::Exit`].
//!
//! There is no locking here. Callers serialize access, typically by owning the
//! coordinator from one task.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::configs::SessionConfig;
use crate::core::channel_session::{ChannelSession, DomainMessage, RequestMsg, SessionLimits};
use crate::core::multipart::{MultiPartResponseEncoder, PaginatedSend, SendError};
use crate::core::registry::StreamRegistration;
use crate::core::reject_policy::{RejectReason, RejectReasonPolicy};
use crate::core::tunnel::TunnelSessionNegotiator;
use crate::core::types::{ChannelHandle, Domain, StreamId, StreamState};
use crate::dictionary::{DataDictionary, DictionaryKind, DictionaryPayload, Verbosity};
use crate::transport::{ChannelTransport, MessageCodec, RefreshMessage, StatusMessage};

/// Channel lifecycle notifications from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Connection established.
    Up,
    /// Connection ready for traffic.
    Ready,
    /// Connection lost; the transport is trying to recover it.
    DownReconnecting,
    /// Connection gone for good.
    Down,
    /// Non-fatal transport warning.
    Warning(String),
}

/// What the shell should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep running.
    Continue,
    /// Shut down.
    Exit,
}

/// Run-time limits measured from coordinator start.
#[derive(Debug, Clone, Copy)]
pub struct RunTimer {
    started: Instant,
    runtime: Duration,
    close_time: Duration,
}

impl RunTimer {
    /// Timer started at `started`.
    pub fn new(started: Instant, runtime: Duration, close_time: Duration) -> Self {
        Self {
            started,
            runtime,
            close_time,
        }
    }

    /// `true` once the run time has elapsed.
    pub fn runtime_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.runtime
    }

    /// `true` once the run time plus the close grace period has elapsed.
    pub fn close_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.runtime + self.close_time
    }
}

/// Outcome of tearing down one channel.
#[derive(Debug)]
pub struct TeardownReport {
    /// Channel torn down.
    pub channel: ChannelHandle,
    /// Streams released, in teardown order.
    pub cleared: Vec<StreamRegistration>,
    /// Close statuses that could not be sent.
    pub close_failures: Vec<(Domain, StreamId, SendError)>,
}

enum OutboundJob {
    Status { channel: ChannelHandle, msg: StatusMessage },
    Refresh { channel: ChannelHandle, msg: RefreshMessage },
    Part(PaginatedSend),
}

impl OutboundJob {
    fn channel(&self) -> ChannelHandle {
        match self {
            OutboundJob::Status { channel, .. } | OutboundJob::Refresh { channel, .. } => *channel,
            OutboundJob::Part(send) => send.channel(),
        }
    }
}

/// # Session Coordinator
///
/// Generic over the transport and codec so the same logic runs behind a
/// websocket shell and inside tests.
pub struct SessionCoordinator<T, C> {
    config: SessionConfig,
    transport: T,
    codec: C,
    dictionary: Arc<DataDictionary>,
    negotiator: TunnelSessionNegotiator,
    sessions: BTreeMap<ChannelHandle, ChannelSession>,
    outbound: VecDeque<OutboundJob>,
    doomed: BTreeSet<ChannelHandle>,
    removed: Vec<ChannelHandle>,
    timer: RunTimer,
    close_handled: bool,
}

impl<T: ChannelTransport, C: MessageCodec> SessionCoordinator<T, C> {
    /// Coordinator whose run timer starts now.
    pub fn new(config: SessionConfig, transport: T, codec: C, dictionary: Arc<DataDictionary>) -> Self {
        Self::with_start(config, transport, codec, dictionary, Instant::now())
    }

    /// Coordinator whose run timer started at `started`.
    pub fn with_start(
        config: SessionConfig,
        transport: T,
        codec: C,
        dictionary: Arc<DataDictionary>,
        started: Instant,
    ) -> Self {
        let timer = RunTimer::new(started, config.runtime(), config.close_time());
        let negotiator = TunnelSessionNegotiator::new(config.supported_class_of_service.clone());
        Self {
            config,
            transport,
            codec,
            dictionary,
            negotiator,
            sessions: BTreeMap::new(),
            outbound: VecDeque::new(),
            doomed: BTreeSet::new(),
            removed: Vec::new(),
            timer,
            close_handled: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn session(&self, channel: ChannelHandle) -> Option<&ChannelSession> {
        self.sessions.get(&channel)
    }

    pub fn channel_count(&self) -> usize {
        self.sessions.len()
    }

    /// Paginated refreshes still in flight.
    pub fn pending_sends(&self) -> usize {
        self.outbound
            .iter()
            .filter(|job| matches!(job, OutboundJob::Part(_)))
            .count()
    }

    /// Single messages waiting for a buffer.
    pub fn deferred_messages(&self) -> usize {
        self.outbound.len() - self.pending_sends()
    }

    /// `true` once the run time elapsed and close statuses went out.
    pub fn is_close_handled(&self) -> bool {
        self.close_handled
    }

    /// Channels removed since the last call. The shell closes their sockets.
    pub fn drain_removed_channels(&mut self) -> Vec<ChannelHandle> {
        std::mem::take(&mut self.removed)
    }

    /// Routes a channel lifecycle event.
    pub fn handle_channel_event(&mut self, channel: ChannelHandle, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Up | LifecycleEvent::Ready => {
                if !self.sessions.contains_key(&channel) {
                    let session = ChannelSession::new(
                        channel,
                        SessionLimits::from(&self.config),
                        self.negotiator.clone(),
                    );
                    self.sessions.insert(channel, session);
                    log::info!("{} connected ({:?})", channel, event);
                } else {
                    log::debug!("{} {:?}", channel, event);
                }
            }
            LifecycleEvent::DownReconnecting => {
                if let Some(session) = self.sessions.get_mut(&channel) {
                    session.clear_transient();
                }
                let dropped = self.drop_outbound(channel);
                log::warn!(
                    "{} down, reconnecting: kept stream slots, dropped {} queued sends",
                    channel,
                    dropped
                );
            }
            LifecycleEvent::Down => {
                let report = self.close_channel(channel);
                log::info!(
                    "{} down: {} streams released, {} close statuses failed",
                    channel,
                    report.cleared.len(),
                    report.close_failures.len()
                );
            }
            LifecycleEvent::Warning(text) => {
                log::warn!("{} warning: {}", channel, text);
            }
        }
    }

    /// Routes a decoded domain message. A rejection is answered on the same
    /// stream and also returned to the caller.
    pub fn handle_domain_message(
        &mut self,
        channel: ChannelHandle,
        domain: Domain,
        msg: DomainMessage,
    ) -> Result<(), RejectReason> {
        if !self.sessions.contains_key(&channel) {
            log::warn!("{}: {} message for unknown channel dropped", channel, domain);
            return Ok(());
        }

        let result = match msg {
            DomainMessage::Request(req) => self.on_request(channel, domain, &req),
            DomainMessage::Close { stream_id } => {
                let was_open = self
                    .sessions
                    .get_mut(&channel)
                    .is_some_and(|s| s.on_close(domain, stream_id));
                self.cancel_part(channel, stream_id);
                if !was_open {
                    log::debug!("{}: close for {} stream {} that was not open", channel, domain, stream_id);
                }
                Ok(())
            }
            DomainMessage::Status {
                stream_id,
                stream_state,
                data_state,
            } => {
                if domain == Domain::Tunnel {
                    let closed = self
                        .sessions
                        .get_mut(&channel)
                        .is_some_and(|s| s.on_tunnel_status(stream_id, stream_state, data_state));
                    if closed {
                        log::info!("{}: tunnel stream {} closed by status", channel, stream_id);
                    }
                } else {
                    log::debug!("{}: status for {} stream {} ignored", channel, domain, stream_id);
                }
                Ok(())
            }
            DomainMessage::Undecodable { stream_id, stream_state } => {
                self.reject_as(channel, Some(domain), stream_id, RejectReason::DecoderFailed, stream_state);
                Err(RejectReason::DecoderFailed)
            }
        };

        self.reap();
        result
    }

    /// Answers a message for a domain this provider does not serve.
    pub fn reject_unsupported_domain(&mut self, channel: ChannelHandle, stream_id: StreamId, label: &str) {
        log::warn!("{}: unsupported domain '{}' on stream {}", channel, label, stream_id);
        self.reject(channel, None, stream_id, RejectReason::DomainNotSupported);
        self.reap();
    }

    fn on_request(&mut self, channel: ChannelHandle, domain: Domain, req: &RequestMsg) -> Result<(), RejectReason> {
        let outcome = match self.sessions.get_mut(&channel) {
            Some(session) => session.on_request(domain, req),
            None => return Ok(()),
        };

        match outcome {
            Ok(registration) => {
                self.respond(channel, domain, req, &registration);
                Ok(())
            }
            Err(reason) => {
                self.reject(channel, Some(domain), req.stream_id, reason);
                Err(reason)
            }
        }
    }

    fn respond(&mut self, channel: ChannelHandle, domain: Domain, req: &RequestMsg, registration: &StreamRegistration) {
        if registration.reissues > 0 && req.no_refresh {
            log::debug!("{}: {} stream {} reissued without refresh", channel, domain, req.stream_id);
            return;
        }

        match domain {
            Domain::Dictionary => self.queue_dictionary(channel, req, registration),
            Domain::Tunnel => {
                let accepted = self
                    .sessions
                    .get(&channel)
                    .and_then(|s| s.negotiation(req.stream_id))
                    .and_then(|n| n.accepted().cloned());
                let msg = RefreshMessage {
                    domain,
                    stream_id: req.stream_id,
                    name: registration.owner_key.clone(),
                    service_id: None,
                    text: "Tunnel stream established".to_string(),
                    private_stream: false,
                    class_of_service: accepted,
                };
                self.run_job(OutboundJob::Refresh { channel, msg });
            }
            Domain::Login | Domain::Directory | Domain::Item => {
                let service_id = match domain {
                    Domain::Login => None,
                    _ => Some(self.config.service_id),
                };
                let msg = RefreshMessage {
                    domain,
                    stream_id: req.stream_id,
                    name: registration.owner_key.clone(),
                    service_id,
                    text: format!("{} refresh completed", domain),
                    private_stream: registration.private_stream,
                    class_of_service: None,
                };
                self.run_job(OutboundJob::Refresh { channel, msg });
            }
        }
    }

    fn queue_dictionary(&mut self, channel: ChannelHandle, req: &RequestMsg, registration: &StreamRegistration) {
        let Some(kind) = DictionaryKind::from_name(&registration.owner_key) else {
            log::error!("{}: registered dictionary '{}' has no payload", channel, registration.owner_key);
            return;
        };
        let verbosity = Verbosity::from_filter(req.filter);
        let payload = match DictionaryPayload::new(&self.dictionary, kind, verbosity) {
            Ok(payload) => payload,
            Err(err) => {
                self.fail_channel(channel, SendError::Encode(err));
                return;
            }
        };
        let max_part_bytes = match kind {
            DictionaryKind::Field => self.config.max_part_bytes,
            DictionaryKind::Enum => self.config.max_enum_part_bytes,
        };

        self.cancel_part(channel, req.stream_id);
        let send = PaginatedSend::new(channel, Domain::Dictionary, req.stream_id, max_part_bytes, Box::new(payload));
        if let Some(session) = self.sessions.get_mut(&channel) {
            session.mark_refresh_pending(Domain::Dictionary, req.stream_id);
        }
        log::info!(
            "{}: {} ({:?}) queued on stream {}: {} bytes",
            channel,
            kind.name(),
            verbosity,
            req.stream_id,
            send.cursor().total_logical_size
        );
        self.outbound.push_back(OutboundJob::Part(send));
    }

    fn reject(&mut self, channel: ChannelHandle, domain: Option<Domain>, stream_id: StreamId, reason: RejectReason) {
        self.reject_as(channel, domain, stream_id, reason, None);
    }

    /// Like `reject`, with the classified stream state replaced when given.
    fn reject_as(
        &mut self,
        channel: ChannelHandle,
        domain: Option<Domain>,
        stream_id: StreamId,
        reason: RejectReason,
        stream_state: Option<StreamState>,
    ) {
        let label = domain.map(|d| d.as_str()).unwrap_or("unknown");
        log::warn!("{}: {} request on stream {} rejected: {}", channel, label, stream_id, reason);

        let class_of_service = match reason {
            RejectReason::ClassOfServiceMismatch => Some(self.negotiator.supported().clone()),
            _ => None,
        };
        let msg = StatusMessage {
            domain,
            stream_id,
            status: match stream_state {
                Some(state) => RejectReasonPolicy::classify(reason).with_stream_state(state),
                None => RejectReasonPolicy::classify(reason),
            },
            class_of_service,
        };
        self.run_job(OutboundJob::Status { channel, msg });
    }

    /// Makes one attempt at `job`. `Ok(true)` means the job is finished.
    fn attempt(&mut self, job: &mut OutboundJob) -> Result<bool, SendError> {
        let single_size = self.config.status_msg_bytes;
        let mut encoder = MultiPartResponseEncoder::new(&mut self.transport, &self.codec);
        match job {
            OutboundJob::Status { channel, msg } => encoder.send_status(*channel, msg, single_size).map(|_| true),
            OutboundJob::Refresh { channel, msg } => encoder.send_refresh(*channel, msg, single_size).map(|_| true),
            OutboundJob::Part(send) => encoder.send_next_part(send).map(|part| part.complete),
        }
    }

    fn run_job(&mut self, mut job: OutboundJob) {
        let channel = job.channel();
        match self.attempt(&mut job) {
            Ok(true) => {
                if let OutboundJob::Part(send) = &job {
                    if let Some(session) = self.sessions.get_mut(&channel) {
                        session.mark_refresh_done(send.domain(), send.stream_id());
                    }
                    log::info!(
                        "{}: {} stream {} refresh complete in {} parts",
                        channel,
                        send.domain(),
                        send.stream_id(),
                        send.cursor().part_index
                    );
                }
            }
            Ok(false) => self.outbound.push_back(job),
            Err(err) if err.is_transient() => {
                log::debug!("{}: {}; retrying next tick", channel, err);
                self.outbound.push_back(job);
            }
            Err(err) => self.fail_channel(channel, err),
        }
    }

    fn fail_channel(&mut self, channel: ChannelHandle, err: SendError) {
        log::error!("{}: send failed, removing channel: {}", channel, err);
        self.doomed.insert(channel);
    }

    fn reap(&mut self) {
        for channel in std::mem::take(&mut self.doomed) {
            self.close_channel(channel);
        }
    }

    fn drop_outbound(&mut self, channel: ChannelHandle) -> usize {
        let before = self.outbound.len();
        self.outbound.retain(|job| job.channel() != channel);
        before - self.outbound.len()
    }

    fn cancel_part(&mut self, channel: ChannelHandle, stream_id: StreamId) {
        self.outbound.retain(|job| match job {
            OutboundJob::Part(send) => !(send.channel() == channel && send.stream_id() == stream_id),
            _ => true,
        });
    }

    /// Tears down one channel: releases its streams in teardown order, sends a
    /// close status for each, and forgets the channel. Close-status failures
    /// are collected, never propagated.
    pub fn close_channel(&mut self, channel: ChannelHandle) -> TeardownReport {
        self.drop_outbound(channel);
        self.doomed.remove(&channel);

        let Some(mut session) = self.sessions.remove(&channel) else {
            return TeardownReport {
                channel,
                cleared: Vec::new(),
                close_failures: Vec::new(),
            };
        };
        let cleared = session.teardown();
        let close_failures = self.send_close_statuses(channel, &cleared);
        self.removed.push(channel);

        TeardownReport {
            channel,
            cleared,
            close_failures,
        }
    }

    fn send_close_statuses(
        &mut self,
        channel: ChannelHandle,
        cleared: &[StreamRegistration],
    ) -> Vec<(Domain, StreamId, SendError)> {
        let size = self.config.status_msg_bytes;
        let mut encoder = MultiPartResponseEncoder::new(&mut self.transport, &self.codec);
        let mut failures = Vec::new();
        for registration in cleared {
            let msg = StatusMessage {
                domain: Some(registration.domain),
                stream_id: registration.stream_id,
                status: RejectReasonPolicy::close_status(registration.domain),
                class_of_service: None,
            };
            if let Err(err) = encoder.send_status(channel, &msg, size) {
                log::debug!(
                    "{}: close status for {} stream {} not sent: {}",
                    channel,
                    registration.domain,
                    registration.stream_id,
                    err
                );
                failures.push((registration.domain, registration.stream_id, err));
            }
        }
        failures
    }

    /// Tears down every channel. Used on process shutdown.
    pub fn teardown_all(&mut self) -> Vec<TeardownReport> {
        let channels: Vec<ChannelHandle> = self.sessions.keys().copied().collect();
        let reports: Vec<TeardownReport> = channels.into_iter().map(|ch| self.close_channel(ch)).collect();
        let streams: usize = reports.iter().map(|r| r.cleared.len()).sum();
        log::info!("Teardown complete: {} channels, {} streams released", reports.len(), streams);
        reports
    }

    /// `true` when no tunnel on any channel can still carry data.
    pub fn all_tunnels_closed(&self) -> bool {
        self.sessions.values().all(ChannelSession::all_tunnels_closed)
    }

    /// Sends a close status on every open stream of every channel, keeping the
    /// channels connected.
    fn close_all_streams(&mut self) {
        let channels: Vec<ChannelHandle> = self.sessions.keys().copied().collect();
        for channel in channels {
            self.drop_outbound(channel);
            let cleared = match self.sessions.get_mut(&channel) {
                Some(session) => session.teardown(),
                None => continue,
            };
            let failures = self.send_close_statuses(channel, &cleared);
            if !failures.is_empty() {
                log::warn!("{}: {} close statuses failed", channel, failures.len());
            }
        }
    }

    /// Advances queued sends by one step each, then applies the run timer.
    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        for _ in 0..self.outbound.len() {
            let Some(job) = self.outbound.pop_front() else {
                break;
            };
            let channel = job.channel();
            if self.doomed.contains(&channel) || !self.still_wanted(&job) {
                continue;
            }
            self.run_job(job);
        }
        self.reap();

        if !self.close_handled && self.timer.runtime_elapsed(now) {
            log::info!("Run time elapsed, closing all streams");
            self.close_all_streams();
            self.close_handled = true;
        }

        if self.timer.close_elapsed(now) || (self.close_handled && self.all_tunnels_closed()) {
            TickOutcome::Exit
        } else {
            TickOutcome::Continue
        }
    }

    fn still_wanted(&self, job: &OutboundJob) -> bool {
        let Some(session) = self.sessions.get(&job.channel()) else {
            return false;
        };
        match job {
            OutboundJob::Part(send) => session.registry(send.domain()).find(send.stream_id()).is_some(),
            OutboundJob::Refresh { msg, .. } => session.registry(msg.domain).find(msg.stream_id).is_some(),
            OutboundJob::Status { .. } => true,
        }
    }
}
