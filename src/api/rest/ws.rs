use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::models::load::DriverId;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct DeviceParams {
    pub driver_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeviceParams>,
) -> impl IntoResponse {
    let driver_id = params.driver_id.map(DriverId::new);
    ws.on_upgrade(move |socket| handle_socket(socket, state, driver_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, driver_id: Option<DriverId>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.alert_events_tx.subscribe();

    info!(driver_id = ?driver_id, "device connected");

    let send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "device channel lagged; alerts dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if driver_id.as_ref().is_some_and(|id| id != event.driver_id()) {
                continue;
            }

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize alert for device");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("device disconnected");
}
