//! Manages the WebSocket connection lifecycle for a realtime session.

use super::protocol::{ClientMessage, ServerMessage};
use crate::{registry::SharedSession, state::AppState};
use anyhow::{Context, Result};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use parking_lot::Mutex;
use signbridge_core::{
    dispatcher::DispatchError, session::Session, types::TranslationResult,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Creates and registers the session, runs its event loop, and on any exit
/// path moves it to `Disconnected` before deregistering it.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (session, results) = Session::open(&state.dispatcher);
    let session_id = session.id();
    let session: SharedSession = Arc::new(Mutex::new(session));
    state.sessions.register(Arc::clone(&session));

    let span = tracing::info_span!("ws_session", %session_id);
    async move {
        info!("Client connected");
        if let Err(e) = run_session(&state, &session, socket, results).await {
            error!(error = ?e, "Session terminated with error.");
        }
        session.lock().disconnect();
        state.sessions.unregister(&session_id);
        info!("Client disconnected");
    }
    .instrument(span)
    .await
}

/// The main event loop for an active WebSocket session.
///
/// Multiplexes inbound client messages, ordered translation results from the
/// dispatch lane, and the server shutdown signal.
async fn run_session(
    state: &Arc<AppState>,
    session: &SharedSession,
    socket: WebSocket,
    mut results: mpsc::UnboundedReceiver<TranslationResult>,
) -> Result<()> {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let session_id = session.lock().id();
    let mut shutdown = state.shutdown.clone();

    send_msg(&mut socket_tx, ServerMessage::Connected { session_id }).await?;

    loop {
        if *shutdown.borrow_and_update() {
            info!("Server shutting down; closing session.");
            let _ = socket_tx.send(Message::Close(None)).await;
            break;
        }

        tokio::select! {
            // Handle messages from the client WebSocket.
            msg_result = socket_rx.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(state, session, &mut socket_tx, text.as_str()).await?;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Ignoring binary message; frames must be sent as `video_frame` events.");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed the connection.");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = ?e, "Error receiving from client WebSocket");
                        break;
                    }
                }
            },
            // Deliver translation results, already in frame order.
            Some(result) = results.recv() => {
                let accepted = session.lock().accept(result);
                if let Some(result) = accepted {
                    debug!(sequence = result.frame_sequence_number, label = %result.label, "Sending translation");
                    send_msg(&mut socket_tx, result.into()).await?;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // The sender is gone, so the server is going away.
                    break;
                }
            },
        }
    }

    Ok(())
}

async fn handle_client_text(
    state: &Arc<AppState>,
    session: &SharedSession,
    socket_tx: &mut SplitSink<WebSocket, Message>,
    text: &str,
) -> Result<()> {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable client message.");
            return Ok(());
        }
    };

    match msg {
        ClientMessage::TextToSign { text } => {
            let may_emit = {
                let mut session = session.lock();
                session.activate();
                session.may_emit()
            };
            let videos = state.sign_index.load().resolve_urls(&text);
            info!(%text, clips = videos.len(), "Resolved text to sign sequence");
            if may_emit {
                send_msg(socket_tx, ServerMessage::SignVideoSequence { videos }).await?;
            }
        }
        ClientMessage::VideoFrame { data } => handle_video_frame(state, session, data).await?,
    }
    Ok(())
}

/// Decodes a frame on the blocking pool and submits it for recognition.
///
/// Nothing is sent to the client here; the translation, if any, arrives later
/// through the dispatch lane.
async fn handle_video_frame(
    state: &Arc<AppState>,
    session: &SharedSession,
    data: String,
) -> Result<()> {
    let (session_id, sequence) = {
        let mut session = session.lock();
        (session.id(), session.next_frame_seq())
    };

    let decoder = state.decoder;
    let decoded = tokio::task::spawn_blocking(move || decoder.decode(session_id, sequence, &data))
        .await
        .context("frame decode task failed")?;
    let frame = match decoded {
        Ok(frame) => frame,
        Err(e) => {
            warn!(sequence, error = ?e, "Dropping undecodable frame.");
            return Ok(());
        }
    };

    let submitted = session.lock().submit(frame);
    match submitted {
        Ok(()) => debug!(sequence, "Frame dispatched for recognition."),
        Err(e @ DispatchError::Overloaded { .. }) => {
            debug!(sequence, error = %e, "Dropping frame under load.");
        }
        Err(e) => warn!(sequence, error = %e, "Frame could not be dispatched."),
    }
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
