//! The streaming plane: bidirectional terminal relay over WebSocket.
//!
//! Binary frames carry raw terminal bytes in both directions; text frames
//! carry JSON control messages (resize in, exit out). On attach the ring
//! snapshot goes out as one binary frame before any live bytes, so replay
//! and live are indistinguishable except by ordering. Failures close the
//! socket with coded close frames so clients can tell "gone" from
//! "process exited" and stop retrying the latter.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use tracing::{debug, info, warn};

use agsh_core::frames::MAX_FRAME_SIZE;
use agsh_core::{ControlFrame, CLOSE_EXITED, CLOSE_NOT_FOUND, CLOSE_UNAUTHENTICATED};

use crate::auth::caller_identity;
use crate::session::{Session, SessionEvent};

use super::AppState;

/// Per-connection lifecycle, mirrored in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Attached,
    Detached,
    Closed,
}

/// `GET /sessions/{id}/stream`
pub async fn stream_session(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, id, headers, state))
}

async fn handle_stream(mut socket: WebSocket, id: String, headers: HeaderMap, state: AppState) {
    // Checks run post-upgrade so failures surface as coded close frames the
    // client can read; plain HTTP statuses are invisible to browser
    // WebSocket callers.
    let identity = match caller_identity(&headers, state.dev_fallback_user.as_deref()) {
        Ok(identity) => identity,
        Err(_) => {
            close_with(&mut socket, CLOSE_UNAUTHENTICATED, "not authenticated").await;
            return;
        }
    };

    let session = match state.registry.get(&id).await {
        Ok(session) if session.owner == identity.user => session,
        _ => {
            close_with(&mut socket, CLOSE_NOT_FOUND, "session not found").await;
            return;
        }
    };

    if !session.is_alive() {
        let frame = ControlFrame::Exit {
            code: session.exit_code(),
        };
        let _ = socket.send(Message::Text(frame.to_json().into())).await;
        close_with(&mut socket, CLOSE_EXITED, "session exited").await;
        return;
    }

    relay(socket, session, &identity.user).await;
}

/// Attach, replay, then pump both directions until either side ends.
async fn relay(mut socket: WebSocket, session: Arc<Session>, user: &str) {
    let mut state = ConnState::Connecting;
    let subscription = session.attach();
    let subscriber_id = subscription.id;
    let mut feed = subscription.feed;
    debug!(
        session_id = %session.id,
        subscriber = subscriber_id,
        state = ?state,
        replay_bytes = subscription.snapshot.len(),
        "replaying snapshot"
    );

    if !subscription.snapshot.is_empty()
        && socket
            .send(Message::Binary(subscription.snapshot.into()))
            .await
            .is_err()
    {
        session.detach(subscriber_id);
        return;
    }

    state = ConnState::Attached;
    info!(
        session_id = %session.id,
        subscriber = subscriber_id,
        user,
        "viewer attached"
    );

    loop {
        tokio::select! {
            event = feed.recv() => match event {
                Some(SessionEvent::Output(data)) => {
                    if socket.send(Message::Binary(data.into())).await.is_err() {
                        state = ConnState::Detached;
                        break;
                    }
                }
                Some(SessionEvent::Exited { code }) => {
                    let frame = ControlFrame::Exit { code };
                    let _ = socket.send(Message::Text(frame.to_json().into())).await;
                    close_with(&mut socket, CLOSE_EXITED, "session exited").await;
                    state = ConnState::Closed;
                    break;
                }
                // Feed gone: this subscriber was dropped for falling behind.
                None => {
                    close_with(&mut socket, 1011, "delivery queue overflow").await;
                    state = ConnState::Closed;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            session_id = %session.id,
                            len = data.len(),
                            "inbound frame too large"
                        );
                        close_with(&mut socket, 1009, "frame too large").await;
                        state = ConnState::Closed;
                        break;
                    }
                    if session.write(data.to_vec()).await.is_err() {
                        // Dead session; the exit event on the feed closes us.
                        continue;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    match ControlFrame::parse(text.as_str()) {
                        Ok(ControlFrame::Resize { cols, rows }) => {
                            debug!(session_id = %session.id, cols, rows, "resize frame");
                            let _ = session.resize(rows, cols);
                        }
                        Ok(ControlFrame::Exit { .. }) => {
                            // Server-to-client only; ignore.
                        }
                        Err(e) => {
                            warn!(session_id = %session.id, error = %e, "bad control frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    state = ConnState::Detached;
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session.id, error = %e, "socket error");
                    state = ConnState::Detached;
                    break;
                }
            },
        }
    }

    // Detaching drops one viewer only; the session keeps running.
    session.detach(subscriber_id);
    info!(
        session_id = %session.id,
        subscriber = subscriber_id,
        state = ?state,
        "viewer detached"
    );
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
