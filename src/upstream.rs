//! Non-streaming upstream client for OpenAI-compatible APIs
//!
//! Builds the outbound request from a [`PreparedRequest`] plus the operator's
//! generation parameters, normalizes the response (id/object/created
//! backfill), and applies the captured regex rules to response content.

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, GenerationConfig};
use crate::prepare::PreparedRequest;
use crate::rules;
use crate::sse;
use crate::template::RegexRule;

/// Errors from talking to the upstream API
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Upstream returned a non-success status
    #[error("upstream API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The configured request timeout elapsed
    #[error("upstream request timed out")]
    Timeout,

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(reqwest::Error),

    /// Upstream replied with a body we could not interpret
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// HTTP status to report to the client for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::Api { status, .. } => *status,
            UpstreamError::Timeout => 504,
            UpstreamError::Network(_) => 502,
            UpstreamError::InvalidResponse(_) => 500,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Network(err)
        }
    }
}

/// Client for forwarding prepared requests upstream
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    generation: GenerationConfig,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Result<Self, UpstreamError> {
        debug!(timeout_secs = config.proxy.request_timeout_secs, "UpstreamClient::new: called");
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.proxy.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            generation: config.generation.clone(),
        })
    }

    /// Outbound JSON body: prepared messages plus operator generation params
    pub fn build_request_body(&self, prepared: &PreparedRequest, stream: bool) -> Value {
        debug!(messages = prepared.messages.len(), stream, "UpstreamClient::build_request_body: called");
        json!({
            "model": prepared.model,
            "messages": prepared.messages,
            "stream": stream,
            "temperature": self.generation.temperature,
            "max_tokens": self.generation.max_tokens,
            "top_p": self.generation.top_p,
            "frequency_penalty": self.generation.frequency_penalty,
            "presence_penalty": self.generation.presence_penalty,
        })
    }

    /// Builder for a streaming upstream call, for the relay to drive
    pub fn stream_request(
        &self,
        target_url: &str,
        api_key: &str,
        prepared: &PreparedRequest,
    ) -> reqwest::RequestBuilder {
        debug!(target_url, "UpstreamClient::stream_request: called");
        self.http
            .post(target_url)
            .bearer_auth(api_key)
            .json(&self.build_request_body(prepared, true))
    }

    /// One non-streaming upstream call; no retries
    pub async fn fetch_completion(
        &self,
        target_url: &str,
        api_key: &str,
        prepared: &PreparedRequest,
        rules: &[RegexRule],
    ) -> Result<Value, UpstreamError> {
        debug!(target_url, "UpstreamClient::fetch_completion: called");

        let response = self
            .http
            .post(target_url)
            .bearer_auth(api_key)
            .json(&self.build_request_body(prepared, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "fetch_completion: upstream error");
            return Err(UpstreamError::Api {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let mut value: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;

        backfill_response(&mut value, prepared.model.as_deref());
        apply_rules_to_response(&mut value, rules);
        Ok(value)
    }
}

/// Fill in `id`, `object` and `created` when the upstream left them out
pub fn backfill_response(response: &mut Value, model_hint: Option<&str>) {
    let Some(map) = response.as_object_mut() else {
        return;
    };
    if !map.get("id").is_some_and(Value::is_string) {
        map.insert("id".to_string(), json!(sse::synthetic_id("resp")));
    }
    if !map.get("object").is_some_and(Value::is_string) {
        map.insert("object".to_string(), json!("chat.completion"));
    }
    if !map.get("created").is_some_and(Value::is_number) {
        map.insert("created".to_string(), json!(sse::unix_now()));
    }
    if !map.get("model").is_some_and(Value::is_string)
        && let Some(model) = model_hint
    {
        map.insert("model".to_string(), json!(model));
    }
}

/// Run the captured regex rules over every textual choice content
pub fn apply_rules_to_response(response: &mut Value, rules: &[RegexRule]) {
    if rules.is_empty() {
        return;
    }
    let Some(choices) = response.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for choice in choices {
        let Some(content) = choice.pointer_mut("/message/content") else {
            continue;
        };
        if let Value::String(text) = content {
            *content = Value::String(rules::apply(text, rules));
        }
    }
}

/// Pull a human-readable message out of an upstream error body
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = value.pointer("/error/message").and_then(Value::as_str)
    {
        return message.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(500).collect()
    }
}
