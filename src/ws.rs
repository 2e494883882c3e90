//! `/transfer/ws/{job_id}`: one subscriber per connection, fed by its own
//! bounded channel rather than a shared broadcast topic, since each job has
//! an independent subscriber set. A slow client never backs up the producer
//! — `JobRegistry::update` drops (and unsubscribes) any subscriber whose
//! queue is full instead of blocking.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::jobs::model::ProgressEvent;
use crate::state::AppState;
use crate::token::{self, TransferClaims};

const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_handler(
    Path(job_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let claims = authorize(&state, &job_id, &query.token)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, claims.job_id)))
}

fn authorize(state: &AppState, job_id: &str, token: &str) -> Result<TransferClaims, AppError> {
    let claims = token::decode_transfer_token(token, token::AUD_STORAGE, state.config.transfer_jwt_secret.as_deref())?;
    if claims.job_id != job_id {
        return Err(AppError::TokenInvalid("token job_id does not match path".into()));
    }
    Ok(claims)
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, job_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);

    let Some((subscriber_id, initial)) = state.registry.add_subscriber(&job_id, tx).await else {
        let _ = sender
            .send(Message::Text(serde_json::json!({"event": "error", "message": "unknown job"}).to_string().into()))
            .await;
        return;
    };

    if sender
        .send(Message::Text(serde_json::to_string(&initial.initial_snapshot_event()).unwrap_or_default().into()))
        .await
        .is_err()
    {
        state.registry.remove_subscriber(&job_id, subscriber_id).await;
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if matches!(event, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }) {
                break;
            }
        }
    });

    // Incoming frames carry no protocol meaning here; drain them so the
    // socket stays readable (and so we notice a client-initiated close).
    let recv_task = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.registry.remove_subscriber(&job_id, subscriber_id).await;
}
