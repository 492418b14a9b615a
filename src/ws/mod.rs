use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broadcast::deliver;
use crate::dispatch::{dispatch, dispatch_bytes, DispatchContext};
use crate::state::AppState;

/// Inbound frames buffered per connection while the worker is busy
const INBOUND_BUFFER: usize = 32;

/// A data frame waiting for the worker
enum InboundFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!(
        "WebSocket connection request: session_id={:?}, token present={}",
        params.session_id,
        params.token.is_some()
    );

    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(mut socket: WebSocket, params: WsQuery, state: Arc<AppState>) {
    let admission = match state.admit(params.token.as_deref(), params.session_id.as_deref()) {
        Ok(admission) => admission,
        Err(e) => {
            tracing::warn!("Refusing WebSocket connection: {}", e);
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: e.to_string().into(),
            }));
            let _ = socket.send(close).await;
            return;
        }
    };

    let connection = admission.connection;
    let connection_id = connection.id.clone();
    let (mut sender, mut receiver) = socket.split();

    // Writer: drains the outbound queue into the socket
    let mut outbound = admission.outbound;
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Worker: handles frames one at a time, in arrival order. It is not tied to
    // the socket, so a call in flight when the client leaves still completes
    // and its contextual update still reaches the rest of the session.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(INBOUND_BUFFER);
    let ctx = DispatchContext::for_connection(&connection);
    let worker_state = state.clone();
    tokio::spawn(async move {
        while let Some(frame) = inbound_rx.recv().await {
            let outcome = match &frame {
                InboundFrame::Text(raw) => dispatch(raw, &ctx, &worker_state).await,
                InboundFrame::Binary(bytes) => dispatch_bytes(bytes, &ctx, &worker_state).await,
            };
            let report = deliver(
                &worker_state,
                &ctx.connection_id,
                &outcome,
                ctx.session_id.as_deref(),
            );
            tracing::debug!(
                "{} from {} delivered to {} (+{} update)",
                outcome.primary.message.type_name(),
                ctx.connection_id,
                report.primary_recipients,
                report.update_recipients
            );
        }
    });

    // Reader
    while let Some(msg) = receiver.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => {
                tracing::debug!("Received message from {}: {}", connection_id, text.as_str());
                InboundFrame::Text(text.as_str().to_owned())
            }
            Ok(Message::Binary(bytes)) => {
                tracing::debug!("Received {} bytes from {}", bytes.len(), connection_id);
                InboundFrame::Binary(bytes)
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by {}", connection_id);
                break;
            }
            // Pings are answered by the protocol layer
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
        };

        if inbound_tx.send(frame).await.is_err() {
            tracing::error!("Worker for {} stopped", connection_id);
            break;
        }
    }

    state.disconnect(&connection_id);
    drop(inbound_tx);
    // Removing the registry entry dropped the last outbound sender
    let _ = writer.await;

    tracing::info!("WebSocket connection closed for {}", connection_id);
}
