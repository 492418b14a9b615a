//! `client_tool_call` handlers

use super::{recall, remember, DispatchContext, Reply};
use crate::backend::{LabelResponse, RateResponse, ShippingOption};
use crate::protocol::{InboundEnvelope, ServerMessage, ToolCall, ToolName};
use crate::proxy::{ToolOutcome, UpstreamResult};
use crate::state::AppState;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Extra options listed after the cheapest and fastest
const MAX_EXTRA_OPTIONS: usize = 3;

pub(super) async fn handle_tool_call(
    state: &Arc<AppState>,
    ctx: &DispatchContext,
    envelope: &InboundEnvelope,
) -> Reply {
    let call = ToolCall::from_envelope(envelope);
    tracing::info!(
        "Tool call {} ({}) from {}",
        call.tool_name.as_str(),
        call.tool_call_id,
        ctx.principal.id
    );

    match &call.tool_name {
        ToolName::GetShippingQuotes => get_shipping_quotes(state, ctx, &call).await,
        ToolName::CreateLabel => create_label(state, ctx, &call).await,
        ToolName::SelectShippingOption => select_shipping_option(state, ctx, &call),
        ToolName::Unknown(name) => {
            tracing::warn!("Unsupported tool '{}' ({})", name, call.tool_call_id);
            (tool_error(&call, format!("Unsupported tool: {}", name)), None)
        }
    }
}

fn tool_result(call: &ToolCall, result: Value) -> ServerMessage {
    ServerMessage::ClientToolResult {
        tool_call_id: call.tool_call_id.clone(),
        result,
        is_error: false,
    }
}

fn tool_error(call: &ToolCall, message: impl Into<String>) -> ServerMessage {
    ServerMessage::ClientToolResult {
        tool_call_id: call.tool_call_id.clone(),
        result: json!({
            "error": message.into(),
            "original_request": call.raw,
        }),
        is_error: true,
    }
}

fn eta(days: u32) -> String {
    if days == 1 {
        "1 day".to_string()
    } else {
        format!("{} days", days)
    }
}

fn option_json(option: &ShippingOption) -> Value {
    json!({
        "carrier": option.carrier,
        "service": option.service_name,
        "price": option.cost,
        "eta": eta(option.transit_days),
    })
}

fn same_service(a: &ShippingOption, b: &ShippingOption) -> bool {
    a.carrier == b.carrier && a.service_name == b.service_name
}

/// Cheapest, then fastest, then whatever of the first few options is not
/// already listed
fn quote_options(rates: &RateResponse) -> Vec<Value> {
    let mut picked = vec![&rates.cheapest_option];
    if let Some(fastest) = &rates.fastest_option {
        if !picked.iter().any(|p| same_service(p, fastest)) {
            picked.push(fastest);
        }
    }

    let extras: Vec<&ShippingOption> = rates
        .all_options
        .iter()
        .take(MAX_EXTRA_OPTIONS)
        .filter(|option| !picked.iter().any(|p| same_service(p, option)))
        .collect();
    picked.extend(extras);

    picked.into_iter().map(option_json).collect()
}

async fn get_shipping_quotes(state: &AppState, ctx: &DispatchContext, call: &ToolCall) -> Reply {
    let outcome = state
        .proxy
        .invoke(&call.tool_name, &call.parameters, state.proxy.deadline())
        .await;

    let rates = match outcome {
        ToolOutcome::Success(UpstreamResult::Quotes(rates)) => rates,
        ToolOutcome::Success(other) => {
            tracing::error!("Quote call returned {:?}", other);
            return (
                tool_error(call, "Failed to get shipping rates: unexpected upstream result"),
                None,
            );
        }
        ToolOutcome::Failure(failure) => {
            return (tool_error(call, failure.error_message(&call.tool_name)), None);
        }
    };

    let options = quote_options(&rates);
    let cheapest = &rates.cheapest_option;
    remember(state, ctx, "last_quote", option_json(cheapest));
    remember(state, ctx, "quote_options", Value::Array(options.clone()));

    let update = ServerMessage::ContextualUpdate {
        text: "quote_ready".to_string(),
        data: json!({
            "from": rates.request.origin_zip,
            "to": rates.request.destination_zip,
            "weight_lbs": rates.request.weight,
            "carrier": cheapest.carrier,
            "service": cheapest.service_name,
            "price": cheapest.cost,
            "eta": eta(cheapest.transit_days),
            "message": format!("Quote ready from {} for ${:.2}", cheapest.carrier, cheapest.cost),
        }),
    };

    (tool_result(call, Value::Array(options)), Some(update))
}

/// Fill carrier and service from the option the user picked earlier
fn with_selected_option(mut params: Map<String, Value>, selected: Option<Value>) -> Map<String, Value> {
    let Some(selected) = selected else {
        return params;
    };

    for (param, key) in [("carrier", "carrier"), ("service_type", "service")] {
        let present = params
            .get(param)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty());
        if present {
            continue;
        }
        if let Some(value) = selected.get(key).and_then(Value::as_str) {
            params.insert(param.to_string(), Value::String(value.to_string()));
        }
    }
    params
}

fn label_json(label: &LabelResponse) -> Value {
    json!({
        "tracking_number": label.tracking_number,
        "label_url": label.label_url,
        "qr_code": label.qr_code(),
        "carrier": label.carrier,
        "estimated_delivery": label.estimated_delivery,
    })
}

async fn create_label(state: &AppState, ctx: &DispatchContext, call: &ToolCall) -> Reply {
    let params = with_selected_option(call.parameters.clone(), recall(state, ctx, "selected_option"));
    let outcome = state
        .proxy
        .invoke(&call.tool_name, &params, state.proxy.deadline())
        .await;

    let label = match outcome {
        ToolOutcome::Success(UpstreamResult::Label(label)) => label,
        ToolOutcome::Success(other) => {
            tracing::error!("Label call returned {:?}", other);
            return (
                tool_error(call, "Failed to create label: unexpected upstream result"),
                None,
            );
        }
        ToolOutcome::Failure(failure) => {
            return (tool_error(call, failure.error_message(&call.tool_name)), None);
        }
    };

    let result = label_json(&label);
    remember(state, ctx, "last_label", result.clone());

    let mut data = result.clone();
    if let Value::Object(map) = &mut data {
        map.insert("service".to_string(), json!(label.service));
        map.insert(
            "message".to_string(),
            Value::String(format!(
                "Label created with {} tracking number {}",
                label.carrier, label.tracking_number
            )),
        );
    }

    let update = ServerMessage::ContextualUpdate {
        text: "label_created".to_string(),
        data,
    };
    (tool_result(call, result), Some(update))
}

/// Record the user's pick; answered locally
fn select_shipping_option(state: &AppState, ctx: &DispatchContext, call: &ToolCall) -> Reply {
    let text = |key: &str| {
        call.parameters
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let Some(carrier) = text("carrier") else {
        return (tool_error(call, "Missing required parameter: carrier"), None);
    };
    let service = text("service").or_else(|| text("service_type"));
    let price = call.parameters.get("price").cloned().unwrap_or(Value::Null);
    let eta = call.parameters.get("eta").cloned().unwrap_or(Value::Null);

    let selected = json!({
        "carrier": carrier,
        "service": service,
        "price": price,
        "eta": eta,
    });
    remember(state, ctx, "selected_option", selected.clone());

    let message = match &service {
        Some(service) => format!("Selected {} {}", carrier, service),
        None => format!("Selected {}", carrier),
    };

    let mut data = selected.clone();
    if let Value::Object(map) = &mut data {
        map.insert("message".to_string(), Value::String(message));
    }

    let update = ServerMessage::ContextualUpdate {
        text: "option_selected".to_string(),
        data,
    };
    (
        tool_result(call, json!({"status": "selected", "selected_option": selected})),
        Some(update),
    )
}
