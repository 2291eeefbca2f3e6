//! Websocket chat endpoint.
//!
//! One connection serves one (user, session) pair. Frames are handled strictly
//! in order: the reply to a frame is sent and its write-back has finished
//! before the next frame is read.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use tracing::Instrument;

use crate::{
    error::AppError,
    middleware::auth::{authenticate, AuthRejection},
    services::TurnReply,
    state::AppState,
    types::{SessionId, UserId},
};

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub session_id: Option<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChatQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let session_id = query
        .session_id
        .as_deref()
        .and_then(SessionId::parse)
        .ok_or_else(|| AppError::BadRequest("session_id is required".to_string()))?;

    // Auth failures are reported on the socket itself, after the upgrade.
    let outcome = authenticate(&headers, state.tokens.as_ref()).await;

    Ok(ws.on_upgrade(move |socket| async move {
        match outcome {
            Ok(user_id) => {
                let span = tracing::info_span!("chat", %user_id, %session_id);
                serve(socket, state, user_id, session_id)
                    .instrument(span)
                    .await
            }
            Err(rejection) => reject(socket, rejection).await,
        }
    }))
}

async fn reject(mut socket: WebSocket, rejection: AuthRejection) {
    let (code, reason) = match rejection {
        AuthRejection::Unauthenticated => (close_code::POLICY, "Unauthorized"),
        AuthRejection::Unavailable(_) => (close_code::ERROR, "Internal error"),
    };
    close(&mut socket, code, reason).await;
}

async fn serve(mut socket: WebSocket, state: AppState, user_id: UserId, session_id: SessionId) {
    let connection_id = state.registry.register(user_id, session_id.clone());
    tracing::info!(%connection_id, "Chat connection opened");

    while let Some(frame) = socket.recv().await {
        let utterance = match frame {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "Chat connection dropped");
                break;
            }
        };

        let Some(reply) = respond(&state, user_id, &session_id, utterance).await else {
            close(&mut socket, close_code::ERROR, "Internal error").await;
            break;
        };

        let delivered = socket
            .send(Message::Text(reply.text().into()))
            .await
            .is_ok();

        // The turn was answered, so it is recorded even if the client left.
        if !persist(&state, user_id, &session_id, reply).await {
            close(&mut socket, close_code::ERROR, "Internal error").await;
            break;
        }
        if !delivered {
            tracing::debug!("Client went away before the reply was delivered");
            break;
        }
    }

    state
        .registry
        .unregister(user_id, &session_id, connection_id);
    tracing::info!(%connection_id, "Chat connection closed");
}

/// Runs the reply half of a turn on its own task; `None` if it panicked.
async fn respond(
    state: &AppState,
    user_id: UserId,
    session_id: &SessionId,
    utterance: String,
) -> Option<TurnReply> {
    let pipeline = state.pipeline.clone();
    let session_id = session_id.clone();
    let task = tokio::spawn(
        async move { pipeline.respond(user_id, &session_id, &utterance).await }
            .in_current_span(),
    );
    match task.await {
        Ok(reply) => Some(reply),
        Err(err) => {
            tracing::error!(error = %err, "Chat turn aborted");
            None
        }
    }
}

/// Runs the write-back half of a turn; `false` if it panicked.
async fn persist(state: &AppState, user_id: UserId, session_id: &SessionId, reply: TurnReply) -> bool {
    let pipeline = state.pipeline.clone();
    let session_id = session_id.clone();
    let task = tokio::spawn(
        async move { pipeline.persist(user_id, &session_id, &reply).await }.in_current_span(),
    );
    match task.await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(error = %err, "Chat turn write-back aborted");
            false
        }
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %err, "Failed to send close frame");
    }
}
