use crate::state::{AppState, JournalSnapshot};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn snapshot_frame(snapshot: &JournalSnapshot) -> Option<Message> {
    let json = serde_json::json!({ "type": "snapshot", "data": snapshot });
    serde_json::to_string(&json).ok().map(|s| Message::Text(s.into()))
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    snapshot: &JournalSnapshot,
) -> bool {
    match snapshot_frame(snapshot) {
        Some(msg) => sender.send(msg).await.is_ok(),
        None => true,
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.ws_tx.subscribe();
    let mut snapshots = state.snapshot_rx.clone();

    // Send initial snapshot
    let initial = snapshots.borrow_and_update().clone();
    if !send_snapshot(&mut sender, &initial).await {
        return;
    }

    // Forward journal events and fresh snapshots to this client
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ws_msg) => {
                        let Ok(json) = serde_json::to_string(&ws_msg) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "ws client lagging, events skipped");
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    if !send_snapshot(&mut sender, &snapshot).await {
                        break;
                    }
                }
            }
        }
    });

    // Read (and discard) incoming messages; detect disconnect
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {} // Commands go through POST /api/command
            }
        }
    });

    // Wait for either task to finish (client disconnected)
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
