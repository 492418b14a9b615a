mod http;
mod internal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub use http::HttpBackend;
pub use internal::{InternalBackend, TIMEOUT_TEST_ZIP};

/// Result type for shipping service operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur talking to the shipping service
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("response parsing failed: {0}")]
    InvalidResponse(String),
}

/// Rate quote request, in the shipping service's vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRequest {
    pub origin_zip: String,
    pub destination_zip: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Value>,
    #[serde(default)]
    pub pickup_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingOption {
    pub carrier: String,
    pub service_name: String,
    pub cost: f64,
    pub transit_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateResponse {
    pub request: RateRequest,
    pub cheapest_option: ShippingOption,
    #[serde(default)]
    pub fastest_option: Option<ShippingOption>,
    #[serde(default)]
    pub all_options: Vec<ShippingOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRequest {
    pub carrier: String,
    pub service_type: String,
    pub shipper: Address,
    pub recipient: Address,
    pub package: Package,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResponse {
    pub tracking_number: String,
    pub carrier: String,
    #[serde(default)]
    pub service: Option<String>,
    pub label_url: String,
    #[serde(default)]
    pub fallback_qr_code_url: Option<String>,
    #[serde(default)]
    pub native_qr_code_base64: Option<String>,
    #[serde(default)]
    pub estimated_delivery: Value,
}

impl LabelResponse {
    pub fn qr_code(&self) -> Option<&str> {
        self.fallback_qr_code_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.native_qr_code_base64.as_deref())
    }
}

/// Trait every shipping service client implements
#[async_trait]
pub trait ShippingBackend: Send + Sync {
    async fn get_rates(&self, request: &RateRequest) -> BackendResult<RateResponse>;

    async fn create_label(&self, request: &LabelRequest) -> BackendResult<LabelResponse>;

    /// Name of this backend, for logs
    fn name(&self) -> &str;
}

fn missing(field: &str) -> String {
    format!("Missing required parameter: {}", field)
}

/// A non-empty string, accepting numbers (zip codes often arrive as numbers)
fn text_param(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// A positive weight, accepting numeric strings
fn weight_param(params: &Map<String, Value>, key: &str) -> Result<f64, String> {
    let weight = match params.get(key) {
        None | Some(Value::Null) => return Err(missing(key)),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Err(missing(key)),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match weight {
        Some(w) if w.is_finite() && w > 0.0 => Ok(w),
        Some(_) => Err("Invalid package weight: must be greater than 0".to_string()),
        None => Err(format!("Invalid parameter: {} must be a number", key)),
    }
}

impl RateRequest {
    /// Build from `get_shipping_quotes` tool parameters (`from_zip`, `to_zip`, `weight`)
    pub fn from_tool_parameters(params: &Map<String, Value>) -> Result<Self, String> {
        let origin_zip = text_param(params, "from_zip").ok_or_else(|| missing("from_zip"))?;
        let destination_zip = text_param(params, "to_zip").ok_or_else(|| missing("to_zip"))?;
        let weight = weight_param(params, "weight")?;

        Ok(Self {
            origin_zip,
            destination_zip,
            weight,
            dimensions: params.get("dimensions").filter(|v| !v.is_null()).cloned(),
            pickup_requested: params
                .get("pickup_requested")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Build from a direct `get_rates` payload (`origin_zip`, `destination_zip`, `weight`)
    pub fn from_rates_payload(payload: &Map<String, Value>) -> Result<Self, String> {
        let field = |name: &str| format!("Missing required field: {}", name);
        let origin_zip = text_param(payload, "origin_zip").ok_or_else(|| field("origin_zip"))?;
        let destination_zip =
            text_param(payload, "destination_zip").ok_or_else(|| field("destination_zip"))?;
        let weight = weight_param(payload, "weight").map_err(|e| {
            if e.starts_with("Missing") {
                field("weight")
            } else {
                e
            }
        })?;

        Ok(Self {
            origin_zip,
            destination_zip,
            weight,
            dimensions: payload.get("dimensions").filter(|v| !v.is_null()).cloned(),
            pickup_requested: payload
                .get("pickup_requested")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

impl LabelRequest {
    /// Build from `create_label` tool parameters.
    ///
    /// Addresses arrive flattened (`shipper_name`, `recipient_zip`, ...);
    /// country defaults to US and the carrier is lowercased.
    pub fn from_tool_parameters(params: &Map<String, Value>) -> Result<Self, String> {
        let carrier = text_param(params, "carrier")
            .ok_or_else(|| missing("carrier"))?
            .to_lowercase();
        let service_type =
            text_param(params, "service_type").ok_or_else(|| missing("service_type"))?;

        let address = |prefix: &str| -> Result<Address, String> {
            let field = |name: &str| {
                text_param(params, &format!("{}_{}", prefix, name)).ok_or_else(|| {
                    let name = if name == "zip" { "zip_code" } else { name };
                    format!("Missing required {} field: {}", prefix, name)
                })
            };
            Ok(Address {
                name: field("name")?,
                street: field("street")?,
                city: field("city")?,
                state: field("state")?,
                zip_code: field("zip")?,
                country: text_param(params, &format!("{}_country", prefix))
                    .unwrap_or_else(|| "US".to_string()),
            })
        };

        let shipper = address("shipper")?;
        let recipient = address("recipient")?;
        let weight = weight_param(params, "weight").map_err(|e| {
            if e.starts_with("Missing") {
                "Invalid package weight: must be greater than 0".to_string()
            } else {
                e
            }
        })?;

        Ok(Self {
            carrier,
            service_type,
            shipper,
            recipient,
            package: Package {
                weight,
                dimensions: params.get("dimensions").filter(|v| !v.is_null()).cloned(),
            },
        })
    }
}

/// Configuration for the shipping service client
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the shipping REST API
    pub api_url: String,
    /// Answer tool calls in-process instead of over HTTP
    pub use_internal: bool,
    /// Deadline for a single outbound call
    pub call_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8003/api".to_string(),
            use_internal: false,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl BackendConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_url = std::env::var("SHIPVOX_API_URL")
            .ok()
            .and_then(|url| {
                let trimmed = url.trim().trim_end_matches('/');
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .unwrap_or(defaults.api_url);

        let use_internal = std::env::var("USE_INTERNAL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let call_timeout = std::env::var("TOOL_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(defaults.call_timeout);

        tracing::info!(
            api_url = %api_url,
            use_internal,
            call_timeout_ms = call_timeout.as_millis() as u64,
            "Shipping backend config loaded"
        );

        Self {
            api_url,
            use_internal,
            call_timeout,
        }
    }

    /// Build the configured backend
    pub fn build_backend(&self) -> BackendResult<Arc<dyn ShippingBackend>> {
        if self.use_internal {
            return Ok(Arc::new(InternalBackend::new()));
        }
        Ok(Arc::new(HttpBackend::new(self.api_url.clone())?))
    }
}
