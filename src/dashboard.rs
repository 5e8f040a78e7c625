use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use crate::monitor::SafetyMonitor;
use crate::status::SafetyStatus;

pub fn router(monitor: Arc<SafetyMonitor>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .with_state(monitor)
}

pub async fn start_dashboard(monitor: Arc<SafetyMonitor>, port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("[DASHBOARD] Serving status at http://{}/status", addr);
    axum::serve(listener, router(monitor)).await
}

async fn status_handler(State(monitor): State<Arc<SafetyMonitor>>) -> Json<SafetyStatus> {
    Json(monitor.status())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(monitor): State<Arc<SafetyMonitor>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, monitor))
}

/// Push every event as a JSON text frame until either side goes away
async fn handle_socket(socket: WebSocket, monitor: Arc<SafetyMonitor>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = monitor.subscribe();

    let mut push = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("[DASHBOARD] client lagging, skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    log::warn!("[DASHBOARD] could not encode event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut drain = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut push => drain.abort(),
        _ = &mut drain => push.abort(),
    }
    log::debug!("[DASHBOARD] websocket client disconnected");
}
