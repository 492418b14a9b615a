//! Wire envelopes exchanged over the WebSocket.
//!
//! Inbound frames are decoded loosely (a JSON object with a `type` string) and
//! classified into a closed [`MessageKind`]; bodies are pulled out per kind by
//! the dispatcher. Outbound frames are a typed [`ServerMessage`] wrapped in an
//! [`Envelope`] that carries the timestamp / requestId metadata.

use crate::types::{new_id, unix_timestamp, RequestId, SessionId};
use serde::Serialize;
use serde_json::{Map, Value};

/// Recognised inbound message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    ClientToolCall,
    GetRates,
    ContextualUpdate,
    UiNavigation,
    Notification,
    Unknown(String),
}

impl MessageKind {
    pub fn from_type(value: &str) -> Self {
        match value {
            "client_tool_call" => MessageKind::ClientToolCall,
            "get_rates" => MessageKind::GetRates,
            "contextual_update" => MessageKind::ContextualUpdate,
            "ui_navigation" => MessageKind::UiNavigation,
            "notification" => MessageKind::Notification,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::ClientToolCall => "client_tool_call",
            MessageKind::GetRates => "get_rates",
            MessageKind::ContextualUpdate => "contextual_update",
            MessageKind::UiNavigation => "ui_navigation",
            MessageKind::Notification => "notification",
            MessageKind::Unknown(other) => other,
        }
    }
}

/// Tools a `client_tool_call` can name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolName {
    GetShippingQuotes,
    CreateLabel,
    SelectShippingOption,
    Unknown(String),
}

impl ToolName {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("get_shipping_quotes") => ToolName::GetShippingQuotes,
            Some("create_label") => ToolName::CreateLabel,
            Some("select_shipping_option") => ToolName::SelectShippingOption,
            Some(other) => ToolName::Unknown(other.to_string()),
            None => ToolName::Unknown("<missing>".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ToolName::GetShippingQuotes => "get_shipping_quotes",
            ToolName::CreateLabel => "create_label",
            ToolName::SelectShippingOption => "select_shipping_option",
            ToolName::Unknown(other) => other,
        }
    }
}

/// Errors produced while decoding an inbound frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid message format: {0}")]
    InvalidJson(String),

    #[error("Invalid message format: expected a JSON object")]
    NotAnObject,

    #[error("Invalid message format: missing required field 'type'")]
    MissingType,

    #[error("Invalid message format: frame is not valid UTF-8")]
    InvalidUtf8,
}

/// A decoded inbound frame.
///
/// A `session_id` field on the frame is left in `body` only; the session a
/// frame belongs to is always the one its connection was admitted into.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub kind: MessageKind,
    pub request_id: Option<RequestId>,
    pub broadcast: bool,
    /// The full object as received
    pub body: Map<String, Value>,
}

impl InboundEnvelope {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let kind = match body.get("type") {
            Some(Value::String(t)) if !t.is_empty() => MessageKind::from_type(t),
            _ => return Err(DecodeError::MissingType),
        };

        let request_id = body
            .get("requestId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let broadcast = body
            .get("broadcast")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            kind,
            request_id,
            broadcast,
            body,
        })
    }

    /// The `payload` object, or an empty map
    pub fn payload(&self) -> Map<String, Value> {
        match self.body.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// The `client_tool_call` body
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_name: ToolName,
    pub tool_call_id: String,
    pub parameters: Map<String, Value>,
    pub raw: Value,
}

/// Reported when a caller omits its tool_call_id
pub const UNKNOWN_TOOL_CALL_ID: &str = "unknown";

impl ToolCall {
    /// Extract the tool call from an envelope.
    ///
    /// Accepts both the top-level `client_tool_call` object and the older
    /// `payload.client_tool_call` nesting. Missing pieces are tolerated so the
    /// caller always gets something it can correlate a result against.
    pub fn from_envelope(envelope: &InboundEnvelope) -> Self {
        let raw = envelope
            .body
            .get("client_tool_call")
            .or_else(|| {
                envelope
                    .body
                    .get("payload")
                    .and_then(|p| p.get("client_tool_call"))
            })
            .cloned()
            .unwrap_or(Value::Null);

        let tool_name = ToolName::parse(raw.get("tool_name").and_then(Value::as_str));
        let tool_call_id = match raw.get("tool_call_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => UNKNOWN_TOOL_CALL_ID.to_string(),
        };
        let parameters = match raw.get("parameters") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        Self {
            tool_name,
            tool_call_id,
            parameters,
            raw,
        }
    }
}

/// Body of an `error` envelope
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_request: Option<Value>,
}

/// Messages the broker emits
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ClientToolResult {
        tool_call_id: String,
        result: Value,
        is_error: bool,
    },
    ContextualUpdate {
        text: String,
        data: Value,
    },
    Error {
        payload: ErrorPayload,
    },
    QuoteReady {
        payload: Value,
    },
    ContextualUpdateReceived {
        payload: Value,
    },
    NavigationProcessed {
        payload: Value,
    },
    NotificationSent {
        payload: Value,
    },
    /// Free-form message injected over HTTP; serialized by [`Envelope::to_value`]
    #[serde(skip)]
    Relay { kind: String, payload: Value },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, original_request: Option<Value>) -> Self {
        ServerMessage::Error {
            payload: ErrorPayload {
                message: message.into(),
                original_request,
            },
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            ServerMessage::ClientToolResult { .. } => "client_tool_result",
            ServerMessage::ContextualUpdate { .. } => "contextual_update",
            ServerMessage::Error { .. } => "error",
            ServerMessage::QuoteReady { .. } => "quote_ready",
            ServerMessage::ContextualUpdateReceived { .. } => "contextual_update_received",
            ServerMessage::NavigationProcessed { .. } => "navigation_processed",
            ServerMessage::NotificationSent { .. } => "notification_sent",
            ServerMessage::Relay { kind, .. } => kind,
        }
    }
}

/// An outbound message plus the metadata every frame carries
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: ServerMessage,
    pub timestamp: f64,
    pub request_id: RequestId,
    pub user: Option<String>,
    pub session_id: Option<SessionId>,
}

impl Envelope {
    /// Wrap a message, echoing the inbound requestId or minting a new one
    pub fn new(message: ServerMessage, request_id: Option<RequestId>) -> Self {
        Self {
            message,
            timestamp: unix_timestamp(),
            request_id: request_id.unwrap_or_else(new_id),
            user: None,
            session_id: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn to_value(&self) -> Value {
        let body = match &self.message {
            ServerMessage::Relay { kind, payload } => {
                let mut map = Map::new();
                map.insert("type".to_string(), Value::String(kind.clone()));
                map.insert("payload".to_string(), payload.clone());
                Value::Object(map)
            }
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        };

        let mut map = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert("timestamp".to_string(), Value::from(self.timestamp));
        map.insert(
            "requestId".to_string(),
            Value::String(self.request_id.clone()),
        );
        if let Some(user) = &self.user {
            map.insert("user".to_string(), Value::String(user.clone()));
        }
        if let Some(session_id) = &self.session_id {
            map.insert("session_id".to_string(), Value::String(session_id.clone()));
        }
        Value::Object(map)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}
