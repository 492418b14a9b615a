//! HTTP endpoints served next to the WebSocket.
//!
//! `/send-message` lets a backend push a free-form message to every client;
//! `/health` reports what the broker is holding.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::broadcast::broadcast_all;
use crate::protocol::{Envelope, ServerMessage};
use crate::state::AppState;
use crate::ws;

/// Body of `POST /send-message`
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub sessions: usize,
}

/// Broadcast a message to every connected client.
///
/// POST /send-message
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    if request.kind.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Message type must not be empty").into_response();
    }

    let envelope = Envelope::new(
        ServerMessage::Relay {
            kind: request.kind,
            payload: request.payload,
        },
        None,
    );
    let recipients = broadcast_all(&state, &envelope);
    tracing::info!(
        "Relayed {} from HTTP to {} connections",
        envelope.message.type_name(),
        recipients
    );

    Json(serde_json::json!({
        "status": "sent",
        "broadcast": envelope.to_value(),
    }))
    .into_response()
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.connections.len(),
        sessions: state.sessions.len(),
    })
}

/// All routes, with CORS and request tracing
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/send-message", post(send_message))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_message_reaches_every_connection() {
        let state = Arc::new(test_state());
        let mut a = state.admit(Some("good"), Some("s1")).unwrap();
        let mut b = state.admit(Some("bob"), Some("s2")).unwrap();

        let response = send_message(
            State(state.clone()),
            Json(SendMessageRequest {
                kind: "banner".to_string(),
                payload: json!({"text": "maintenance at noon"}),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        for rx in [&mut a.outbound, &mut b.outbound] {
            let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "banner");
            assert_eq!(frame["payload"]["text"], "maintenance at noon");
            assert!(frame["timestamp"].as_f64().is_some());
            assert!(frame["requestId"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn test_send_message_requires_type() {
        let state = Arc::new(test_state());
        let response = send_message(
            State(state),
            Json(SendMessageRequest {
                kind: " ".to_string(),
                payload: Value::Null,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_router_serves_health_and_send_message() {
        use axum::body::{to_bytes, Body};
        use axum::http::Request;
        use tower::ServiceExt;

        let state = Arc::new(test_state());
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["connections"], 0);

        let request = Request::post("/send-message")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"type":"banner","payload":{"text":"hi"}}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let sent: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(sent["status"], "sent");
        assert_eq!(sent["broadcast"]["type"], "banner");
    }

    #[tokio::test]
    async fn test_health_counts() {
        let state = Arc::new(test_state());
        let _a = state.admit(Some("good"), Some("s1")).unwrap();

        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 1);
        assert_eq!(health.sessions, 1);
    }
}
