use crate::provider_logic::state::ProviderState;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

/// Drives the coordinator tick at the pacing interval and logs a statistics
/// line every `stats_every`.
pub async fn run(
    pacing: Duration,
    stats_every: Duration,
    app_state: ProviderState,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick_interval = interval(pacing);
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_interval = interval(stats_every);
    stats_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = tick_interval.tick() => {
                if !app_state.tick() {
                    log::info!("Coordinator is gone, monitor stopping.");
                    break;
                }
            }
            _ = stats_interval.tick() => {
                match app_state.snapshot().await {
                    Some(s) => log::info!(
                        "Sessions: {} channels, {} paginated sends in flight, {} deferred messages{}",
                        s.channels,
                        s.pending_sends,
                        s.deferred_messages,
                        if s.close_handled { ", closing" } else { "" }
                    ),
                    None => break,
                }
            }
        }
    }
}
