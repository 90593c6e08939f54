use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use weir_core::error::{Result, WeirError};

use crate::retry::{classify_request_error, classify_status};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Single-shot messages call. The node input supplies the prompt:
/// either a bare string, or `{"prompt": ..., "system": ...}`; any other
/// shape is sent as pretty-printed JSON.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    client: &Client,
    model: &str,
    api_key: Option<&str>,
    base_url: Option<&str>,
    max_tokens: u32,
    input: &Value,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value> {
    let api_key =
        api_key.ok_or_else(|| WeirError::Config(format!("API key not set for model {}", model)))?;
    let url = base_url.unwrap_or(ANTHROPIC_API_URL);
    let (system, prompt) = extract_prompt(input)?;

    let body = MessagesRequest {
        model,
        max_tokens,
        messages: vec![ApiMessage {
            role: "user",
            content: prompt,
        }],
        system,
    };

    let request = client
        .post(url)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("content-type", "application/json")
        .timeout(timeout)
        .json(&body);

    let response = tokio::select! {
        response = request.send() => {
            response.map_err(|e| classify_request_error(e, timeout.as_secs()))?
        }
        _ = cancel.cancelled() => return Err(WeirError::Cancelled),
    };

    let status = response.status();
    let text = tokio::select! {
        text = response.text() => {
            text.map_err(|e| classify_request_error(e, timeout.as_secs()))?
        }
        _ = cancel.cancelled() => return Err(WeirError::Cancelled),
    };

    if !status.is_success() {
        return Err(classify_status(status, &text));
    }
    parse_response(&text)
}

fn extract_prompt(input: &Value) -> Result<(Option<String>, String)> {
    match input {
        Value::String(s) => Ok((None, s.clone())),
        Value::Object(map) => {
            let system = map.get("system").and_then(|v| v.as_str()).map(String::from);
            let prompt = match map.get("prompt") {
                Some(Value::String(p)) => p.clone(),
                Some(other) => serde_json::to_string_pretty(other)?,
                None => serde_json::to_string_pretty(input)?,
            };
            Ok((system, prompt))
        }
        other => Ok((None, serde_json::to_string_pretty(other)?)),
    }
}

fn parse_response(body: &str) -> Result<Value> {
    let response: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| WeirError::Permanent(format!("malformed model response: {}", e)))?;

    let text: String = response
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut output = json!({ "text": text });
    if let Some(stop) = response.stop_reason {
        output["stop_reason"] = json!(stop);
    }
    if let Some(usage) = response.usage {
        output["usage"] = json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        });
    }
    Ok(output)
}
