//! WebSocket transport for gateway sessions.
//!
//! Each upgraded socket is split in two: a writer task drains the session's
//! frame channel into the socket, and the reader loop feeds client frames
//! to the gateway. A bad client frame is logged and ignored; only a socket
//! error, a close or process shutdown ends the session.
//!
//! Ending a session drops its registry entry. That closes the frame
//! channel, so the writer flushes what is queued, sends a close frame and
//! exits.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Gateway, SessionId};
use crate::shutdown::ShutdownSignal;

/// How long the writer gets to flush and close after the session ends.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct WsState {
    gateway: Arc<Gateway>,
    shutdown: ShutdownSignal,
}

/// Why a socket's reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    ClientClosed,
    WriterDone,
    Shutdown,
}

/// Router exposing `GET /ws`. Open sockets are closed once `shutdown`
/// fires.
pub fn router(gateway: Arc<Gateway>, shutdown: ShutdownSignal) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState { gateway, shutdown })
}

/// Upgrade the request and hand the socket to the gateway.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.gateway, state.shutdown))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, shutdown: ShutdownSignal) {
    let session = gateway.connect().await;
    let session_id = session.id;
    let mut frames = session.frames;
    let (mut sender, receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                debug!(session_id = %session_id, "Socket write failed");
                break;
            }
        }
        let _ = sender.close().await;
    });

    let end = pump(receiver, &gateway, session_id, &mut writer, &shutdown).await;

    gateway.disconnect(session_id).await;
    if end != LoopEnd::WriterDone && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        warn!(session_id = %session_id, "Socket writer did not finish, aborting");
        writer.abort();
    }
    info!(session_id = %session_id, reason = ?end, "Socket closed");
}

/// Feed client frames to the gateway until the client goes away, the
/// writer stops or shutdown begins.
async fn pump<S>(
    mut incoming: S,
    gateway: &Gateway,
    session_id: SessionId,
    writer: &mut JoinHandle<()>,
    shutdown: &ShutdownSignal,
) -> LoopEnd
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        tokio::select! {
            received = incoming.next() => match received {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = gateway.on_client_event(session_id, text.as_str()).await {
                        warn!(session_id = %session_id, error = %e, "Client event dropped");
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    gateway.metrics().malformed_event();
                    warn!(session_id = %session_id, "Binary frame ignored");
                }
                Some(Ok(Message::Close(_))) | None => return LoopEnd::ClientClosed,
                // Pings are answered by the websocket layer
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "Socket read failed");
                    return LoopEnd::ClientClosed;
                }
            },
            _ = &mut *writer => return LoopEnd::WriterDone,
            _ = shutdown.recv() => {
                debug!(session_id = %session_id, "Closing socket for shutdown");
                return LoopEnd::Shutdown;
            }
        }
    }
}
