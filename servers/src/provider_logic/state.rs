use crate::provider_logic::model::Inbound;
use crate::provider_logic::ws_transport::{ClientLink, WsTransport};
use lib_session::dictionary::DataDictionary;
use lib_session::transport::json_codec::JsonCodec;
use lib_session::{ChannelHandle, LifecycleEvent, SessionConfig, SessionCoordinator, TickOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Point-in-time view of the coordinator, served on `/health`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub channels: usize,
    pub pending_sends: usize,
    pub deferred_messages: usize,
    pub close_handled: bool,
}

#[derive(Debug)]
pub enum Command {
    Connected { channel: ChannelHandle, link: ClientLink },
    Lifecycle { channel: ChannelHandle, event: LifecycleEvent },
    Inbound { channel: ChannelHandle, frame: Inbound },
    Disconnected { channel: ChannelHandle },
    Tick,
    Snapshot(oneshot::Sender<Snapshot>),
}

/// Cheap handle the socket tasks and the monitor use to reach the coordinator.
#[derive(Clone)]
pub struct ProviderState {
    commands: mpsc::UnboundedSender<Command>,
    channel_buffer_bytes: u64,
}

impl ProviderState {
    /// Builds the handle and the actor that owns the coordinator. The actor
    /// must be spawned for the handle to do anything.
    pub fn new(
        session: SessionConfig,
        dictionary: Arc<DataDictionary>,
        channel_buffer_bytes: u64,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, CoordinatorActor) {
        let (commands, rx) = mpsc::unbounded_channel();
        let coordinator = SessionCoordinator::new(session, WsTransport::new(), JsonCodec::new(), dictionary);
        let actor = CoordinatorActor {
            coordinator,
            commands: rx,
            shutdown_tx,
        };
        (
            Self {
                commands,
                channel_buffer_bytes,
            },
            actor,
        )
    }

    pub fn channel_buffer_bytes(&self) -> u64 {
        self.channel_buffer_bytes
    }

    pub fn connect(&self, channel: ChannelHandle, link: ClientLink) {
        self.send(Command::Connected { channel, link });
    }

    pub fn lifecycle(&self, channel: ChannelHandle, event: LifecycleEvent) {
        self.send(Command::Lifecycle { channel, event });
    }

    pub fn inbound(&self, channel: ChannelHandle, frame: Inbound) {
        self.send(Command::Inbound { channel, frame });
    }

    pub fn disconnect(&self, channel: ChannelHandle) {
        self.send(Command::Disconnected { channel });
    }

    /// Returns `false` once the actor has stopped.
    pub fn tick(&self) -> bool {
        self.commands.send(Command::Tick).is_ok()
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    fn send(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            log::debug!("Coordinator has stopped; command dropped.");
        }
    }
}

/// Sole owner of the [`SessionCoordinator`]. Every mutation goes through its
/// command queue, so the coordinator itself needs no locking.
pub struct CoordinatorActor {
    coordinator: SessionCoordinator<WsTransport, JsonCodec>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CoordinatorActor {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Coordinator received shutdown signal.");
                    break;
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle(cmd) == TickOutcome::Exit {
                        log::info!("Session run finished, requesting shutdown.");
                        let _ = self.shutdown_tx.send(());
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    fn handle(&mut self, cmd: Command) -> TickOutcome {
        let mut outcome = TickOutcome::Continue;
        match cmd {
            Command::Connected { channel, link } => {
                self.coordinator.transport_mut().attach(channel, link);
                self.coordinator.handle_channel_event(channel, LifecycleEvent::Up);
                self.coordinator.handle_channel_event(channel, LifecycleEvent::Ready);
            }
            Command::Lifecycle { channel, event } => {
                self.coordinator.handle_channel_event(channel, event);
            }
            Command::Inbound { channel, frame } => match frame {
                Inbound::Message { domain, msg } => {
                    if let Err(reason) = self.coordinator.handle_domain_message(channel, domain, msg) {
                        log::debug!("{}: {} message answered with {}", channel, domain, reason);
                    }
                }
                Inbound::UnsupportedDomain { stream_id, label } => {
                    self.coordinator.reject_unsupported_domain(channel, stream_id, &label);
                }
            },
            Command::Disconnected { channel } => {
                self.coordinator.handle_channel_event(channel, LifecycleEvent::Down);
                self.coordinator.transport_mut().detach(channel);
            }
            Command::Tick => {
                outcome = self.coordinator.on_tick(Instant::now());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
        self.detach_removed();
        outcome
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            channels: self.coordinator.channel_count(),
            pending_sends: self.coordinator.pending_sends(),
            deferred_messages: self.coordinator.deferred_messages(),
            close_handled: self.coordinator.is_close_handled(),
        }
    }

    // Channels the coordinator gave up on lose their writer queue, which
    // makes their socket task hang up.
    fn detach_removed(&mut self) {
        for channel in self.coordinator.drain_removed_channels() {
            if self.coordinator.transport_mut().detach(channel) {
                log::info!("{} disconnected by provider", channel);
            }
        }
    }

    fn shutdown(&mut self) {
        let reports = self.coordinator.teardown_all();
        for report in reports.iter().filter(|r| !r.close_failures.is_empty()) {
            log::warn!(
                "{}: {} close statuses could not be sent during shutdown",
                report.channel,
                report.close_failures.len()
            );
        }
        self.detach_removed();
        log::info!("Coordinator stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider_logic::model::parse_client_frame;
    use crate::provider_logic::ws_transport::OutboundFrame;
    use lib_session::transport::buffer_pool::BufferPool;
    use lib_session::transport::json_codec::DecodedFrame;
    use lib_session::{Domain, StreamState};

    const CH: ChannelHandle = ChannelHandle(7);

    fn actor(session: SessionConfig) -> CoordinatorActor {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (_state, actor) = ProviderState::new(session, Arc::new(DataDictionary::builtin()), 1 << 20, shutdown_tx);
        actor
    }

    fn connect(actor: &mut CoordinatorActor) -> (mpsc::UnboundedReceiver<OutboundFrame>, BufferPool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = BufferPool::new(1 << 20);
        actor.handle(Command::Connected {
            channel: CH,
            link: ClientLink::new(tx, pool.clone()),
        });
        (rx, pool)
    }

    fn send(actor: &mut CoordinatorActor, text: &str) {
        let frame = parse_client_frame(text).unwrap();
        actor.handle(Command::Inbound { channel: CH, frame });
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>, pool: &BufferPool) -> DecodedFrame {
        let frame = rx.try_recv().unwrap();
        pool.release(frame.reserved);
        JsonCodec::decode_frame(&frame.bytes).unwrap()
    }

    #[test]
    fn test_login_refresh_reaches_socket_queue() {
        let mut actor = actor(SessionConfig::default());
        let (mut rx, pool) = connect(&mut actor);
        send(&mut actor, r#"{"kind":"request","domain":"login","streamId":1,"name":"alice"}"#);

        match next(&mut rx, &pool) {
            DecodedFrame::Refresh { domain, stream_id, name, .. } => {
                assert_eq!(domain, Domain::Login);
                assert_eq!(stream_id, 1);
                assert_eq!(name, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_unsupported_domain_is_rejected() {
        let mut actor = actor(SessionConfig::default());
        let (mut rx, pool) = connect(&mut actor);
        send(&mut actor, r#"{"kind":"request","domain":"symbolList","streamId":3}"#);

        match next(&mut rx, &pool) {
            DecodedFrame::Status { domain, stream_id, stream_state, .. } => {
                assert_eq!(domain, None);
                assert_eq!(stream_id, 3);
                assert_eq!(stream_state, StreamState::Closed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dictionary_paced_by_ticks() {
        let session = SessionConfig {
            max_part_bytes: 512,
            ..SessionConfig::default()
        };
        let mut actor = actor(session);
        let (mut rx, pool) = connect(&mut actor);
        send(
            &mut actor,
            r#"{"kind":"request","domain":"dictionary","streamId":4,"name":"RWFFld","filter":7}"#,
        );
        assert!(rx.try_recv().is_err());

        let mut parts = 0;
        loop {
            actor.handle(Command::Tick);
            match next(&mut rx, &pool) {
                DecodedFrame::RefreshPart { part_index, refresh_complete, .. } => {
                    assert_eq!(part_index, parts);
                    parts += 1;
                    if refresh_complete {
                        break;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(rx.try_recv().is_err(), "one part per tick");
        }
        assert!(parts > 1);
        assert_eq!(actor.snapshot().pending_sends, 0);
    }

    #[test]
    fn test_disconnect_releases_channel() {
        let mut actor = actor(SessionConfig::default());
        let (_rx, _pool) = connect(&mut actor);
        send(&mut actor, r#"{"kind":"request","domain":"login","streamId":1,"name":"alice"}"#);
        assert_eq!(actor.snapshot().channels, 1);

        actor.handle(Command::Disconnected { channel: CH });
        assert_eq!(actor.snapshot().channels, 0);
        assert!(!actor.coordinator.transport().is_attached(CH));
    }

    #[test]
    fn test_stopped_writer_gets_channel_removed() {
        let mut actor = actor(SessionConfig::default());
        let (rx, _pool) = connect(&mut actor);
        drop(rx);
        send(&mut actor, r#"{"kind":"request","domain":"login","streamId":1,"name":"alice"}"#);

        assert_eq!(actor.snapshot().channels, 0);
        assert!(!actor.coordinator.transport().is_attached(CH));
    }

    #[test]
    fn test_expired_run_time_exits_on_tick() {
        let session = SessionConfig {
            runtime_secs: 0,
            close_time_secs: 0,
            ..SessionConfig::default()
        };
        let mut actor = actor(session);
        let (_rx, _pool) = connect(&mut actor);
        assert_eq!(actor.handle(Command::Tick), TickOutcome::Exit);
        assert!(actor.snapshot().close_handled);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_actor() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (state, actor) = ProviderState::new(
            SessionConfig::default(),
            Arc::new(DataDictionary::builtin()),
            1 << 20,
            shutdown_tx.clone(),
        );
        let handle = tokio::spawn(actor.run(shutdown_tx.subscribe()));

        let (tx, _rx) = mpsc::unbounded_channel();
        state.connect(CH, ClientLink::new(tx, BufferPool::new(1 << 20)));
        let snapshot = state.snapshot().await.unwrap();
        assert_eq!(snapshot.channels, 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(state.snapshot().await.is_none());
    }
}
