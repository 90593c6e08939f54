use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use weir_core::error::{Result, WeirError};

use crate::retry::{classify_request_error, classify_status};

const BODY_SNIPPET_BYTES: usize = 500;

/// Single HTTP call to an integration endpoint. The payload goes out as
/// JSON; a JSON response comes back as-is, anything else is wrapped as
/// `{"text": ...}`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    client: &Client,
    url: &str,
    method: &str,
    headers: &HashMap<String, String>,
    bearer_token: Option<&str>,
    payload: &Value,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value> {
    let method: reqwest::Method = method
        .to_uppercase()
        .parse()
        .map_err(|_| WeirError::Config(format!("invalid HTTP method: {}", method)))?;

    let mut request = client
        .request(method, url)
        .timeout(timeout)
        .json(payload);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(token) = bearer_token {
        request = request.bearer_auth(token);
    }

    let response = tokio::select! {
        response = request.send() => {
            response.map_err(|e| classify_request_error(e, timeout.as_secs()))?
        }
        _ = cancel.cancelled() => return Err(WeirError::Cancelled),
    };

    let status = response.status();
    let body = tokio::select! {
        body = response.text() => {
            body.map_err(|e| classify_request_error(e, timeout.as_secs()))?
        }
        _ = cancel.cancelled() => return Err(WeirError::Cancelled),
    };

    if !status.is_success() {
        return Err(classify_status(status, snippet(&body)));
    }
    Ok(parse_body(&body))
}

fn parse_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| json!({ "text": body }))
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET_BYTES) {
        Some((i, _)) => &body[..i],
        None => body,
    }
}
