use crate::provider_logic::model::parse_client_frame;
use crate::provider_logic::state::ProviderState;
use crate::provider_logic::ws_transport::{ClientLink, OutboundFrame};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use lib_session::transport::buffer_pool::BufferPool;
use lib_session::{ChannelHandle, LifecycleEvent};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub fn router(app_state: ProviderState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

pub async fn run(port: u16, app_state: ProviderState, shutdown_tx: broadcast::Sender<()>) {
    let mut shutdown = shutdown_tx.subscribe();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", addr, e);
            let _ = shutdown_tx.send(());
            return;
        }
    };
    log::info!("Downstream server listening on {}", addr);

    let served = axum::serve(listener, router(app_state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await;
    if let Err(e) = served {
        log::error!("Downstream server failed: {}", e);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ProviderState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<ProviderState>) -> impl IntoResponse {
    match state.snapshot().await {
        Some(snapshot) => (axum::http::StatusCode::OK, Json(Some(snapshot))),
        None => (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(None)),
    }
}

fn to_message(frame: &OutboundFrame) -> Message {
    match std::str::from_utf8(&frame.bytes) {
        Ok(text) => Message::Text(text.to_owned().into()),
        Err(_) => Message::Binary(frame.bytes.clone()),
    }
}

async fn handle_socket(socket: WebSocket, state: ProviderState) {
    let channel = ChannelHandle(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let pool = BufferPool::new(state.channel_buffer_bytes());
    state.connect(channel, ClientLink::new(out_tx, pool.clone()));
    log::info!("Client {} connected", channel);

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            // Handle incoming messages from the client
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match parse_client_frame(text.as_str()) {
                    Some(frame) => state.inbound(channel, frame),
                    None => state.lifecycle(
                        channel,
                        LifecycleEvent::Warning("dropped a frame with no domain or stream id".to_string()),
                    ),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("Client {} read error: {}", channel, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            // Handle frames the coordinator queued for this client
            outbound = out_rx.recv() => match outbound {
                Some(frame) => {
                    let sent = sink.send(to_message(&frame)).await;
                    pool.release(frame.reserved);
                    if sent.is_err() {
                        break; // client disconnected
                    }
                }
                None => {
                    log::info!("Client {} dropped by the coordinator", channel);
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    state.disconnect(channel);
    log::info!("Client {} disconnected", channel);
}
