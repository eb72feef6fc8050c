//! Fake streaming: emulate an SSE stream over a non-streaming upstream call
//!
//! The upstream fetch runs in a background task while the stream yields
//! heartbeat chunks at a fixed interval. Once the fetch resolves, the full
//! response is decomposed into role/content/finish delta frames (or a single
//! error frame) and the stream terminates with exactly one `[DONE]` sentinel.
//! Dropping the stream aborts the background fetch.

use std::future::Future;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::rules;
use crate::sse;
use crate::template::RegexRule;
use crate::upstream::UpstreamError;

/// Aborts the wrapped task when dropped, so a client disconnect cancels the
/// in-flight upstream call instead of leaking it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Emulate a streaming response from a pending non-streaming fetch
///
/// `rules` were captured at preparation time; the fetch itself must not
/// apply them, or the content would be processed twice.
pub fn emulate<F>(
    fetch: F,
    model_hint: Option<String>,
    rules: Vec<RegexRule>,
    heartbeat_interval: Duration,
) -> impl Stream<Item = String> + Send
where
    F: Future<Output = Result<Value, UpstreamError>> + Send + 'static,
{
    debug!(?heartbeat_interval, "emulate: called");
    let mut task = AbortOnDrop(tokio::spawn(fetch));

    stream! {
        let heartbeat_model = model_hint.clone().unwrap_or_else(|| sse::FALLBACK_MODEL.to_string());

        let joined = loop {
            match timeout(heartbeat_interval, &mut task.0).await {
                Ok(joined) => break joined,
                Err(_) => {
                    debug!("emulate: heartbeat");
                    yield sse::heartbeat_frame(&heartbeat_model);
                }
            }
        };

        match joined {
            Ok(Ok(response)) => {
                for frame in decompose(response, model_hint.as_deref(), &rules) {
                    yield frame;
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "emulate: upstream fetch failed");
                yield sse::error_frame(&err.to_string(), Some(err.status_code()), "api_error");
            }
            Err(join_err) if join_err.is_cancelled() => {
                warn!("emulate: upstream fetch was cancelled");
                yield sse::error_frame(
                    "request was cancelled on the server side",
                    None,
                    "server_request_cancelled",
                );
            }
            Err(join_err) => {
                warn!(error = %join_err, "emulate: upstream fetch task failed");
                yield sse::error_frame(
                    &format!("internal error while fetching upstream response: {join_err}"),
                    None,
                    "internal_error",
                );
            }
        }

        yield sse::DONE_FRAME.to_string();
    }
}

/// Break a full chat completion into streaming delta frames
///
/// A response that does not look like a chat completion passes through as
/// one raw data frame, unaltered.
fn decompose(mut response: Value, model_hint: Option<&str>, rules: &[RegexRule]) -> Vec<String> {
    let message = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(Value::as_object);
    if message.is_none() {
        warn!("decompose: response is not a chat completion, passing through raw");
        return vec![sse::data_frame(&response)];
    }

    let id = response
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| sse::synthetic_id("fake"));
    let model = response
        .get("model")
        .and_then(Value::as_str)
        .or(model_hint)
        .unwrap_or(sse::FALLBACK_MODEL)
        .to_string();
    let created = response
        .get("created")
        .and_then(Value::as_i64)
        .unwrap_or_else(sse::unix_now);

    let finish_reason = response
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    let role = response
        .pointer("/choices/0/message/role")
        .and_then(Value::as_str)
        .map(str::to_string);

    // Regex rules only touch textual assistant content.
    if role.as_deref() == Some("assistant")
        && let Some(content) = response.pointer_mut("/choices/0/message/content")
        && let Value::String(text) = content
    {
        *content = Value::String(rules::apply(text, rules));
    }
    let content = response.pointer("/choices/0/message/content").cloned();

    let mut frames = Vec::with_capacity(3);
    if let Some(role) = role {
        frames.push(sse::role_frame(&id, &model, created, &role));
    }
    match content {
        Some(Value::Null) | None => {}
        Some(content) => frames.push(sse::content_frame(&id, &model, created, &content)),
    }
    if let Some(reason) = finish_reason {
        frames.push(sse::finish_frame(&id, &model, created, &reason));
    }
    debug!(frames = frames.len(), "decompose: done");
    frames
}
