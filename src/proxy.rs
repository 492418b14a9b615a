//! Outbound calls to the shipping service, bounded by a deadline.
//!
//! Every tool call that needs the shipping service goes through
//! [`OutboundCallProxy`]. Parameters are validated before anything leaves the
//! process, and every failure is folded into a [`ToolFailure`] whose
//! [`ToolFailure::error_message`] is what the caller sees in `result.error`.

use crate::backend::{
    BackendError, LabelRequest, LabelResponse, RateRequest, RateResponse, ShippingBackend,
};
use crate::protocol::ToolName;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reported for every tool whose outbound call exceeds its deadline
pub const UPSTREAM_TIMEOUT_ERROR: &str = "timeout calling rates endpoint";

/// Why a tool call failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolFailure {
    #[error("{0}")]
    Validation(String),

    #[error("{}", UPSTREAM_TIMEOUT_ERROR)]
    Timeout,

    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("could not reach upstream: {0}")]
    Connectivity(String),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl From<BackendError> for ToolFailure {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout => ToolFailure::Timeout,
            BackendError::Status { status, body } => ToolFailure::UpstreamStatus { status, body },
            BackendError::Connection(msg) => ToolFailure::Connectivity(msg),
            BackendError::InvalidResponse(msg) => ToolFailure::InvalidResponse(msg),
        }
    }
}

impl ToolFailure {
    /// Text placed in `result.error` for a failed call to `tool`
    pub fn error_message(&self, tool: &ToolName) -> String {
        match self {
            ToolFailure::Timeout => UPSTREAM_TIMEOUT_ERROR.to_string(),
            ToolFailure::Validation(msg) => msg.clone(),
            other => match tool {
                ToolName::GetShippingQuotes => format!("Failed to get shipping rates: {}", other),
                ToolName::CreateLabel => format!("Failed to create label: {}", other),
                _ => format!("Failed to call {}: {}", tool.as_str(), other),
            },
        }
    }
}

/// A validated request ready to send
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCall {
    Rates(RateRequest),
    Label(LabelRequest),
}

impl OutboundCall {
    /// Validate tool parameters into a request, without touching the network
    pub fn from_tool(tool: &ToolName, params: &Map<String, Value>) -> Result<Self, ToolFailure> {
        match tool {
            ToolName::GetShippingQuotes => RateRequest::from_tool_parameters(params)
                .map(OutboundCall::Rates)
                .map_err(ToolFailure::Validation),
            ToolName::CreateLabel => LabelRequest::from_tool_parameters(params)
                .map(OutboundCall::Label)
                .map_err(ToolFailure::Validation),
            other => Err(ToolFailure::Validation(format!(
                "Unsupported tool: {}",
                other.as_str()
            ))),
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            OutboundCall::Rates(_) => "get-rates",
            OutboundCall::Label(_) => "labels",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResult {
    Quotes(RateResponse),
    Label(LabelResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(UpstreamResult),
    Failure(ToolFailure),
}

/// Runs outbound calls against a shipping backend
#[derive(Clone)]
pub struct OutboundCallProxy {
    backend: Arc<dyn ShippingBackend>,
    deadline: Duration,
}

impl OutboundCallProxy {
    pub fn new(backend: Arc<dyn ShippingBackend>, deadline: Duration) -> Self {
        tracing::info!(
            "Outbound call proxy using {} backend with a {}ms deadline",
            backend.name(),
            deadline.as_millis()
        );
        Self { backend, deadline }
    }

    /// Default deadline for a single call
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Validate and execute a tool call. No retries.
    pub async fn invoke(
        &self,
        tool: &ToolName,
        params: &Map<String, Value>,
        deadline: Duration,
    ) -> ToolOutcome {
        match OutboundCall::from_tool(tool, params) {
            Ok(call) => self.execute(call, deadline).await,
            Err(failure) => {
                tracing::debug!("Rejected {} call before sending: {}", tool.as_str(), failure);
                ToolOutcome::Failure(failure)
            }
        }
    }

    pub async fn execute(&self, call: OutboundCall, deadline: Duration) -> ToolOutcome {
        let endpoint = call.endpoint();
        let start = Instant::now();

        let result = tokio::time::timeout(deadline, async {
            match &call {
                OutboundCall::Rates(req) => {
                    self.backend.get_rates(req).await.map(UpstreamResult::Quotes)
                }
                OutboundCall::Label(req) => {
                    self.backend.create_label(req).await.map(UpstreamResult::Label)
                }
            }
        })
        .await;

        match result {
            Ok(Ok(upstream)) => {
                tracing::debug!(
                    "{} via {} succeeded in {}ms",
                    endpoint,
                    self.backend.name(),
                    start.elapsed().as_millis()
                );
                ToolOutcome::Success(upstream)
            }
            Ok(Err(e)) => {
                tracing::warn!("{} via {} failed: {}", endpoint, self.backend.name(), e);
                ToolOutcome::Failure(e.into())
            }
            Err(_) => {
                tracing::warn!(
                    "{} via {} exceeded {}ms deadline",
                    endpoint,
                    self.backend.name(),
                    deadline.as_millis()
                );
                ToolOutcome::Failure(ToolFailure::Timeout)
            }
        }
    }
}
