//! Handlers for the non-tool message types

use super::Reply;
use crate::backend::RateRequest;
use crate::protocol::{InboundEnvelope, ServerMessage, ToolName};
use crate::proxy::{OutboundCall, ToolOutcome, UpstreamResult};
use crate::state::AppState;
use serde_json::{json, Value};

/// Direct rate lookup; answers with `quote_ready` and no contextual update
pub(super) async fn handle_get_rates(state: &AppState, envelope: &InboundEnvelope) -> Reply {
    let request = match RateRequest::from_rates_payload(&envelope.payload()) {
        Ok(request) => request,
        Err(message) => {
            return (
                ServerMessage::error(message, Some(envelope.to_value())),
                None,
            )
        }
    };

    let outcome = state
        .proxy
        .execute(OutboundCall::Rates(request), state.proxy.deadline())
        .await;

    let message = match outcome {
        ToolOutcome::Success(UpstreamResult::Quotes(rates)) => match serde_json::to_value(&rates) {
            Ok(payload) => ServerMessage::QuoteReady { payload },
            Err(e) => ServerMessage::error(
                format!("Error processing rate request: {}", e),
                Some(envelope.to_value()),
            ),
        },
        ToolOutcome::Success(_) => ServerMessage::error(
            "Error processing rate request: unexpected upstream result",
            Some(envelope.to_value()),
        ),
        ToolOutcome::Failure(failure) => ServerMessage::error(
            format!(
                "Error processing rate request: {}",
                failure.error_message(&ToolName::GetShippingQuotes)
            ),
            Some(envelope.to_value()),
        ),
    };

    (message, None)
}

/// A client pushing context to its peers; acked and re-broadcast
pub(super) fn handle_contextual_update(envelope: &InboundEnvelope) -> Reply {
    let payload = envelope.payload();
    let update_type = envelope
        .body
        .get("text")
        .or_else(|| payload.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let data = envelope
        .body
        .get("data")
        .or_else(|| payload.get("data"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    tracing::info!("Contextual update '{}'", update_type);

    let ack = ServerMessage::ContextualUpdateReceived {
        payload: json!({
            "message": format!("Received {} update", update_type),
            "update_type": update_type,
            "status": "success",
        }),
    };
    let update = ServerMessage::ContextualUpdate {
        text: update_type,
        data,
    };
    (ack, Some(update))
}

pub(super) fn handle_ui_navigation(envelope: &InboundEnvelope) -> Reply {
    let target = envelope.payload().get("target").cloned().unwrap_or(Value::Null);
    let label = target.as_str().unwrap_or("unknown").to_string();

    let ack = ServerMessage::NavigationProcessed {
        payload: json!({
            "message": format!("Navigation to {} processed", label),
            "target": target,
            "status": "success",
        }),
    };
    let update = ServerMessage::ContextualUpdate {
        text: "navigation".to_string(),
        data: json!({ "target": target }),
    };
    (ack, Some(update))
}

pub(super) fn handle_notification(envelope: &InboundEnvelope) -> Reply {
    let payload = envelope.payload();
    let field = |key: &str, default: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };

    let ack = ServerMessage::NotificationSent {
        payload: json!({
            "message": "Notification delivered",
            "status": "success",
        }),
    };
    let update = ServerMessage::ContextualUpdate {
        text: "notification".to_string(),
        data: json!({
            "type": field("type", "info"),
            "title": field("title", "Notification"),
            "message": field("message", ""),
        }),
    };
    (ack, Some(update))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TIMEOUT_TEST_ZIP;
    use crate::state::test_state;

    fn decode(value: Value) -> InboundEnvelope {
        InboundEnvelope::decode(&value.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_get_rates_quote_ready() {
        let state = test_state();
        let envelope = decode(json!({
            "type": "get_rates",
            "payload": {"origin_zip": "89101", "destination_zip": "10001", "weight": 2}
        }));

        let (message, update) = handle_get_rates(&state, &envelope).await;
        match message {
            ServerMessage::QuoteReady { payload } => {
                assert_eq!(payload["request"]["origin_zip"], "89101");
                assert!(payload["cheapest_option"]["cost"].as_f64().is_some());
            }
            other => panic!("Expected QuoteReady, got {:?}", other),
        }
        assert!(update.is_none());
    }

    #[tokio::test]
    async fn test_get_rates_missing_field() {
        let state = test_state();
        let envelope = decode(json!({"type": "get_rates", "payload": {"origin_zip": "89101"}}));

        let (message, _) = handle_get_rates(&state, &envelope).await;
        assert_eq!(
            message,
            ServerMessage::error(
                "Missing required field: destination_zip",
                Some(envelope.to_value())
            )
        );
    }

    #[tokio::test]
    async fn test_get_rates_timeout() {
        let state = test_state();
        let envelope = decode(json!({
            "type": "get_rates",
            "payload": {"origin_zip": TIMEOUT_TEST_ZIP, "destination_zip": "10001", "weight": 2}
        }));

        let (message, _) = handle_get_rates(&state, &envelope).await;
        match message {
            ServerMessage::Error { payload } => assert_eq!(
                payload.message,
                "Error processing rate request: timeout calling rates endpoint"
            ),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_contextual_update_ack_and_rebroadcast() {
        let envelope = decode(json!({
            "type": "contextual_update",
            "text": "address_confirmed",
            "data": {"zip": "10001"}
        }));

        let (ack, update) = handle_contextual_update(&envelope);
        match ack {
            ServerMessage::ContextualUpdateReceived { payload } => {
                assert_eq!(payload["message"], "Received address_confirmed update");
                assert_eq!(payload["status"], "success");
            }
            other => panic!("Expected ack, got {:?}", other),
        }
        assert_eq!(
            update,
            Some(ServerMessage::ContextualUpdate {
                text: "address_confirmed".to_string(),
                data: json!({"zip": "10001"}),
            })
        );
    }

    #[test]
    fn test_navigation() {
        let envelope = decode(json!({"type": "ui_navigation", "payload": {"target": "labels"}}));
        let (ack, update) = handle_ui_navigation(&envelope);

        match ack {
            ServerMessage::NavigationProcessed { payload } => {
                assert_eq!(payload["message"], "Navigation to labels processed")
            }
            other => panic!("Expected NavigationProcessed, got {:?}", other),
        }
        match update {
            Some(ServerMessage::ContextualUpdate { text, data }) => {
                assert_eq!(text, "navigation");
                assert_eq!(data["target"], "labels");
            }
            other => panic!("Expected navigation update, got {:?}", other),
        }
    }

    #[test]
    fn test_notification_defaults() {
        let envelope = decode(json!({"type": "notification"}));
        let (_, update) = handle_notification(&envelope);

        match update {
            Some(ServerMessage::ContextualUpdate { data, .. }) => {
                assert_eq!(data["type"], "info");
                assert_eq!(data["title"], "Notification");
                assert_eq!(data["message"], "");
            }
            other => panic!("Expected notification update, got {:?}", other),
        }
    }
}
