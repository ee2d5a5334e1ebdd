// WebSocket handler streaming one session's events to observers.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};

use super::AppState;
use crate::db::Session;
use crate::engine::lifecycle::SessionStatus;
use crate::metrics;

/// WebSocket upgrade handler for `/ws/sessions/{pin}`.
pub async fn ws_session(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(pin): Path<String>,
) -> impl IntoResponse {
    let session = match state.live.session_by_pin(&pin).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_ws(socket, state, session))
}

async fn send(socket: &mut WebSocket, text: String) -> bool {
    if socket.send(Message::Text(text.into())).await.is_err() {
        return false;
    }
    metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc();
    true
}

async fn handle_ws(mut socket: WebSocket, state: AppState, session: Session) {
    metrics::CONNECTED_WEBSOCKETS.inc();
    stream_events(&mut socket, &state, session).await;
    metrics::CONNECTED_WEBSOCKETS.dec();
}

/// Send the frozen final standings of a finished session, then close.
async fn send_final(socket: &mut WebSocket, state: &AppState, session: &Session) {
    match state.live.final_standings(session).await {
        Ok(Some(view)) => {
            let frame = serde_json::json!({
                "type": "leaderboard",
                "session_id": session.id,
                "entries": view.entries,
                "teams": view.teams,
            });
            send(socket, frame.to_string()).await;
        }
        Ok(None) => {}
        Err(e) => tracing::error!(session_id = session.id, "Failed to load final results: {e}"),
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn stream_events(socket: &mut WebSocket, state: &AppState, session: Session) {
    let session_id = session.id;
    if session.status() == SessionStatus::Completed {
        send_final(socket, state, &session).await;
        return;
    }

    let Some((mut rx, latest)) = state.hub.subscribe(session_id) else {
        // Ended between the lookup and the subscribe.
        send_final(socket, state, &session).await;
        return;
    };

    // Completion may have committed before the channel was closed.
    if let Ok(Some(current)) = state.live.db().get_session(session_id).await {
        if current.status() == SessionStatus::Completed {
            send_final(socket, state, &current).await;
            return;
        }
    }

    // Replay the last leaderboard so late joiners see standings immediately.
    if let Some(frame) = latest {
        if !send(socket, frame).await {
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if !send(socket, msg).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        // Session completed or deleted.
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(session_id, "WebSocket client lagged, skipped {n} messages");
                    }
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
