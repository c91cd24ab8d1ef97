use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State as AxumState,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use skirmish_types::PlayerId;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Duration};

use crate::Simulator;

fn ws_send_timeout() -> Duration {
    let raw = std::env::var("WS_SEND_TIMEOUT_MS").ok();
    let parsed = raw
        .as_deref()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0);
    Duration::from_millis(parsed.unwrap_or(2_000))
}

pub(super) async fn events_ws(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(player): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let player = PlayerId::new(player);
    ws.on_upgrade(move |socket| handle_socket(socket, simulator, player))
}

async fn handle_socket(socket: WebSocket, simulator: Arc<Simulator>, player: PlayerId) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = simulator.subscribe();
    let send_timeout = ws_send_timeout();
    tracing::debug!(%player, "event stream connected");

    loop {
        tokio::select! {
            update = updates.recv() => {
                let delivery = match update {
                    Ok(delivery) => delivery,
                    Err(RecvError::Lagged(skipped)) => {
                        // The pull channel still holds what the push channel dropped.
                        tracing::warn!(%player, skipped, "event stream lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if delivery.player != player {
                    continue;
                }
                let Ok(text) = serde_json::to_string(&delivery.event) else {
                    continue;
                };
                match timeout(send_timeout, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        tracing::warn!(%player, "event stream send timed out");
                        break;
                    }
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!(%player, "event stream closed");
}
