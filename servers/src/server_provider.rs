use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

mod provider_logic;
use provider_logic::{config, downstream, logger, monitor, state};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), &config.log_level())?;

    let session = config::load_session_config(&config)?;
    let dictionary = Arc::new(config::load_dictionary(&session)?);
    log::info!(
        "Serving {} (id {}): dictionary {} with {} fields, run time {}s",
        session.service_name,
        session.service_id,
        dictionary.version,
        dictionary.fields.len(),
        session.runtime_secs
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let mut finished = shutdown_tx.subscribe();
    let (app_state, actor) = state::ProviderState::new(
        session.clone(),
        dictionary,
        config.channel_buffer_bytes(),
        shutdown_tx.clone(),
    );

    let actor_handle = tokio::spawn(actor.run(shutdown_tx.subscribe()));

    let monitor_handle = tokio::spawn(monitor::run(
        session.pacing(),
        config.stats_interval(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let downstream_handle = tokio::spawn(downstream::run(
        config.port(),
        app_state.clone(),
        shutdown_tx.clone(),
    ));

    // Wait for a shutdown signal, or for the session run to finish on its own
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = finished.recv() => {
            log::info!("Provider finished its run.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let _ = tokio::try_join!(actor_handle, monitor_handle, downstream_handle);

    log::info!("Shutdown complete.");
    Ok(())
}
