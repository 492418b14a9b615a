//! Inbound frame dispatch
//!
//! Decodes a frame, routes it by message type to a handler and wraps the
//! handler's reply in envelopes. Handlers only return values; sending is left
//! to the connection loop and [`crate::broadcast::deliver`].

mod messages;
mod tools;

use crate::protocol::{DecodeError, Envelope, InboundEnvelope, MessageKind, ServerMessage};
use crate::state::AppState;
use crate::types::{new_id, Connection, ConnectionId, Principal, SessionId};
use serde_json::Value;
use std::sync::Arc;

/// Who sent the frame being dispatched
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub connection_id: ConnectionId,
    pub principal: Principal,
    pub session_id: Option<SessionId>,
}

impl DispatchContext {
    pub fn for_connection(connection: &Connection) -> Self {
        Self {
            connection_id: connection.id.clone(),
            principal: connection.principal.clone(),
            session_id: Some(connection.session_id.clone()),
        }
    }
}

/// Everything produced for one inbound frame
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub primary: Envelope,
    pub contextual_update: Option<Envelope>,
    /// Send `primary` to every connection instead of just the sender
    pub broadcast: bool,
}

/// Primary message plus optional contextual update
type Reply = (ServerMessage, Option<ServerMessage>);

/// Error reply for a frame that could not be decoded
fn rejected(ctx: &DispatchContext, error: DecodeError, raw: &str) -> DispatchOutcome {
    tracing::warn!("Rejected frame from {}: {}", ctx.connection_id, error);
    let primary = Envelope::new(
        ServerMessage::error(error.to_string(), Some(Value::String(raw.to_string()))),
        None,
    )
    .with_user(ctx.principal.id.clone());
    DispatchOutcome {
        primary,
        contextual_update: None,
        broadcast: false,
    }
}

/// Handle one binary frame; it must hold UTF-8 JSON like a text frame
pub async fn dispatch_bytes(
    bytes: &[u8],
    ctx: &DispatchContext,
    state: &Arc<AppState>,
) -> DispatchOutcome {
    match std::str::from_utf8(bytes) {
        Ok(raw) => dispatch(raw, ctx, state).await,
        Err(_) => rejected(ctx, DecodeError::InvalidUtf8, &String::from_utf8_lossy(bytes)),
    }
}

/// Handle one inbound frame
pub async fn dispatch(raw: &str, ctx: &DispatchContext, state: &Arc<AppState>) -> DispatchOutcome {
    let envelope = match InboundEnvelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(e) => return rejected(ctx, e, raw),
    };

    tracing::debug!(
        "Dispatching {} from {} ({})",
        envelope.kind.as_str(),
        ctx.connection_id,
        ctx.principal.id
    );

    // Held until the reply is built, outbound call included
    let _lease = ctx
        .session_id
        .as_deref()
        .map(|id| state.sessions.lease(id, &ctx.principal));

    let (primary, update) = match &envelope.kind {
        MessageKind::ClientToolCall => tools::handle_tool_call(state, ctx, &envelope).await,
        MessageKind::GetRates => messages::handle_get_rates(state, &envelope).await,
        MessageKind::ContextualUpdate => messages::handle_contextual_update(&envelope),
        MessageKind::UiNavigation => messages::handle_ui_navigation(&envelope),
        MessageKind::Notification => messages::handle_notification(&envelope),
        MessageKind::Unknown(kind) => {
            tracing::warn!("Unsupported message type '{}' from {}", kind, ctx.connection_id);
            (
                ServerMessage::error(
                    format!("Unsupported message type: {}", kind),
                    Some(envelope.to_value()),
                ),
                None,
            )
        }
    };

    // The reply and its update share one requestId
    let request_id = Some(envelope.request_id.clone().unwrap_or_else(new_id));
    let primary = Envelope::new(primary, request_id.clone()).with_user(ctx.principal.id.clone());
    let contextual_update = update.map(|message| {
        let update = Envelope::new(message, request_id).with_user(ctx.principal.id.clone());
        match &ctx.session_id {
            Some(session_id) => update.with_session(session_id.clone()),
            None => update,
        }
    });

    DispatchOutcome {
        primary,
        contextual_update,
        broadcast: envelope.broadcast,
    }
}

/// Store a value in the sender's session, if it has one
fn remember(state: &AppState, ctx: &DispatchContext, key: &str, value: Value) {
    let Some(session_id) = &ctx.session_id else {
        return;
    };
    if let Err(e) = state.sessions.set_state(session_id, key, value) {
        tracing::warn!("Could not store {} for {}: {}", key, ctx.principal.id, e);
    }
}

/// Read a value from the sender's session
fn recall(state: &AppState, ctx: &DispatchContext, key: &str) -> Option<Value> {
    ctx.session_id
        .as_deref()
        .and_then(|session_id| state.sessions.get_state(session_id, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use serde_json::json;

    fn context(state: &AppState, session: &str) -> DispatchContext {
        let admission = state.admit(Some("good"), Some(session)).unwrap();
        DispatchContext::for_connection(&admission.connection)
    }

    #[tokio::test]
    async fn test_malformed_frames_yield_error_envelope() {
        let state = Arc::new(test_state());
        let ctx = context(&state, "s1");

        for raw in ["not json", "[1]", r#"{"payload":{}}"#] {
            let outcome = dispatch(raw, &ctx, &state).await;
            let value = outcome.primary.to_value();
            assert_eq!(value["type"], "error");
            assert!(value["payload"]["message"]
                .as_str()
                .unwrap()
                .starts_with("Invalid message format"));
            assert_eq!(value["payload"]["original_request"], raw);
            assert!(outcome.contextual_update.is_none());
            assert!(!outcome.broadcast);
        }
    }

    #[tokio::test]
    async fn test_binary_frames() {
        let state = Arc::new(test_state());
        let ctx = context(&state, "s1");

        let outcome = dispatch_bytes(&[b'{', 0xff, 0xfe, b'}'], &ctx, &state).await;
        let value = outcome.primary.to_value();
        assert_eq!(value["type"], "error");
        assert_eq!(
            value["payload"]["message"],
            "Invalid message format: frame is not valid UTF-8"
        );
        assert!(outcome.contextual_update.is_none());

        let outcome = dispatch_bytes(br#"{"type":"dance"}"#, &ctx, &state).await;
        assert_eq!(
            outcome.primary.to_value()["payload"]["message"],
            "Unsupported message type: dance"
        );
    }

    #[tokio::test]
    async fn test_unsupported_message_type() {
        let state = Arc::new(test_state());
        let ctx = context(&state, "s1");

        let outcome = dispatch(r#"{"type":"dance","requestId":"r9"}"#, &ctx, &state).await;
        let value = outcome.primary.to_value();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["message"], "Unsupported message type: dance");
        assert_eq!(value["requestId"], "r9");
        assert_eq!(value["user"], "alice");
    }

    #[tokio::test]
    async fn test_update_is_stamped_with_session() {
        let state = Arc::new(test_state());
        let ctx = context(&state, "s1");

        let frame = json!({
            "type": "contextual_update",
            "text": "cart_changed",
            "data": {"items": 2},
            "broadcast": true
        });
        let outcome = dispatch(&frame.to_string(), &ctx, &state).await;

        assert!(outcome.broadcast);
        let update = outcome.contextual_update.unwrap();
        assert_eq!(update.session_id.as_deref(), Some("s1"));
        assert_eq!(update.request_id, outcome.primary.request_id);
    }

    #[tokio::test]
    async fn test_frame_session_field_does_not_redirect_update() {
        let state = Arc::new(test_state());
        let ctx = context(&state, "s1");

        let frame = json!({
            "type": "contextual_update",
            "session_id": "elsewhere",
            "text": "cart_changed",
            "data": {}
        });
        let outcome = dispatch(&frame.to_string(), &ctx, &state).await;

        let update = outcome.contextual_update.unwrap();
        assert_eq!(update.session_id.as_deref(), Some("s1"));
        assert!(!state.sessions.contains("elsewhere"));
    }

    #[tokio::test]
    async fn test_tool_reply_and_update_share_minted_request_id() {
        let state = Arc::new(test_state());
        let ctx = context(&state, "s1");

        let frame = json!({
            "type": "client_tool_call",
            "client_tool_call": {
                "tool_name": "select_shipping_option",
                "tool_call_id": "sel-1",
                "parameters": {"carrier": "UPS", "service": "Ground", "price": 9.5}
            }
        });
        let outcome = dispatch(&frame.to_string(), &ctx, &state).await;

        let update = outcome.contextual_update.unwrap();
        assert!(!outcome.primary.request_id.is_empty());
        assert_eq!(update.request_id, outcome.primary.request_id);
    }

    #[tokio::test]
    async fn test_dispatch_without_session() {
        let state = Arc::new(test_state());
        let ctx = DispatchContext {
            connection_id: "c1".to_string(),
            principal: Principal::new("alice"),
            session_id: None,
        };

        let outcome = dispatch(
            r#"{"type":"notification","payload":{"title":"Hi"}}"#,
            &ctx,
            &state,
        )
        .await;
        assert!(outcome.contextual_update.unwrap().session_id.is_none());
        assert!(state.sessions.is_empty());
    }
}
