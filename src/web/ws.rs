//! Realtime now-playing subscription.
//!
//! Every subscriber gets the current snapshot on connect and then the
//! same JSON array the poller broadcasts on each tick. Subscribers hang
//! off a broadcast channel; a client that cannot keep up lags and skips
//! frames instead of slowing the poller or other subscribers.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::AppState;

pub async fn now_playing_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber(socket, state))
}

async fn handle_subscriber(mut socket: WebSocket, state: AppState) {
    let mut rx = state.poller.subscribe();

    let initial = state.poller.latest_snapshot().await;
    if socket.send(Message::Text(initial)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            broadcastmsg = rx.recv() => {
                match broadcastmsg {
                    Ok(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            debug!("subscriber went away");
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "slow subscriber skipped frames");
                    }
                    Err(RecvError::Closed) => {
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    // Clients only ever send pings or a close; anything
                    // else is ignored.
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}
