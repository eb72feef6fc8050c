//! Real streaming passthrough for clients when emulation is disabled
//!
//! Upstream SSE chunks are forwarded as-is apart from id/object/created
//! backfill. Delta content is accumulated along the way; when the upstream
//! signals `[DONE]`, the captured regex rules run over the accumulated text
//! and, if they changed anything, one corrective content chunk is emitted
//! before the sentinel. Errors become one SSE error frame followed by the
//! sentinel, so the client's reader never hangs.

use async_stream::stream;
use futures::{Stream, StreamExt};
use reqwest_eventsource::{Event, EventSource};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::rules;
use crate::sse;
use crate::template::RegexRule;

/// Drive an upstream streaming request, yielding serialized SSE frames
pub fn relay(request: reqwest::RequestBuilder, regex_rules: Vec<RegexRule>) -> impl Stream<Item = String> + Send {
    debug!(rules = regex_rules.len(), "relay: called");

    stream! {
        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(err) => {
                warn!(error = %err, "relay: could not open upstream stream");
                yield sse::error_frame(
                    &format!("failed to open upstream stream: {err}"),
                    None,
                    "upstream_stream_error",
                );
                yield sse::DONE_FRAME.to_string();
                return;
            }
        };

        let mut accumulated = String::new();

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    if message.data.trim() == "[DONE]" {
                        if let Some(frame) = correction_frame(&accumulated, &regex_rules) {
                            yield frame;
                        }
                        yield sse::DONE_FRAME.to_string();
                        source.close();
                        return;
                    }
                    match serde_json::from_str::<Value>(&message.data) {
                        Ok(mut chunk) => {
                            backfill_chunk(&mut chunk);
                            accumulate_content(&chunk, &mut accumulated);
                            yield sse::data_frame(&chunk);
                        }
                        Err(err) => {
                            // Forward unparseable chunks untouched
                            debug!(error = %err, "relay: passing through non-JSON chunk");
                            yield format!("data: {}\n\n", message.data);
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)) => {
                    warn!(status = status.as_u16(), "relay: upstream rejected stream");
                    yield sse::error_frame(
                        &format!("upstream API error {status}"),
                        Some(status.as_u16()),
                        "api_error",
                    );
                    yield sse::DONE_FRAME.to_string();
                    source.close();
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "relay: upstream stream error");
                    yield sse::error_frame(
                        &format!("upstream stream error: {err}"),
                        None,
                        "upstream_stream_error",
                    );
                    yield sse::DONE_FRAME.to_string();
                    source.close();
                    return;
                }
            }
        }

        // Upstream closed without sending [DONE]; the sentinel still goes out.
        yield sse::DONE_FRAME.to_string();
    }
}

/// Fill chunk identity fields the upstream left out
fn backfill_chunk(chunk: &mut Value) {
    let Some(map) = chunk.as_object_mut() else {
        return;
    };
    if !map.get("id").is_some_and(Value::is_string) {
        map.insert("id".to_string(), json!(sse::synthetic_id("chunk")));
    }
    if !map.get("object").is_some_and(Value::is_string) {
        map.insert("object".to_string(), json!("chat.completion.chunk"));
    }
    if !map.get("created").is_some_and(Value::is_number) {
        map.insert("created".to_string(), json!(sse::unix_now()));
    }
}

/// Collect textual delta content for the end-of-stream regex pass
fn accumulate_content(chunk: &Value, accumulated: &mut String) {
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return;
    };
    for choice in choices {
        if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
            accumulated.push_str(text);
        }
    }
}

/// If the rules change the accumulated content, build one corrective chunk
/// carrying the fully processed text
fn correction_frame(accumulated: &str, regex_rules: &[RegexRule]) -> Option<String> {
    if regex_rules.is_empty() || accumulated.is_empty() {
        return None;
    }
    let processed = rules::apply(accumulated, regex_rules);
    if processed == accumulated {
        return None;
    }
    debug!("correction_frame: regex rules changed streamed content, emitting correction");
    Some(sse::data_frame(&json!({
        "object": "chat.completion.chunk",
        "choices": [{
            "index": 0,
            "delta": {"content": processed},
            "finish_reason": Value::Null,
        }],
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{RegexRule, RuleAction};
    use serde_json::json;

    fn rule(find: &str, replace: &str) -> RegexRule {
        RegexRule {
            find: find.to_string(),
            replace: replace.to_string(),
            action: RuleAction::Replace,
        }
    }

    #[test]
    fn test_backfill_chunk_fills_identity_fields() {
        let mut chunk = json!({"choices": [{"delta": {"content": "x"}}]});
        backfill_chunk(&mut chunk);
        assert!(chunk["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert!(chunk["created"].is_number());
    }

    #[test]
    fn test_backfill_chunk_keeps_existing_identity() {
        let mut chunk = json!({"id": "orig", "object": "chat.completion.chunk", "created": 9});
        backfill_chunk(&mut chunk);
        assert_eq!(chunk["id"], "orig");
        assert_eq!(chunk["created"], 9);
    }

    #[test]
    fn test_accumulate_content_across_choices() {
        let mut acc = String::new();
        accumulate_content(&json!({"choices": [{"delta": {"content": "he"}}]}), &mut acc);
        accumulate_content(&json!({"choices": [{"delta": {"content": "llo"}}]}), &mut acc);
        accumulate_content(&json!({"choices": [{"delta": {"role": "assistant"}}]}), &mut acc);
        assert_eq!(acc, "hello");
    }

    #[test]
    fn test_correction_frame_only_on_change() {
        assert!(correction_frame("text", &[]).is_none());
        assert!(correction_frame("", &[rule("a", "b")]).is_none());
        assert!(correction_frame("xyz", &[rule("a", "b")]).is_none());

        let frame = correction_frame("a cat", &[rule("cat", "dog")]).unwrap();
        let value: Value = serde_json::from_str(frame.strip_prefix("data: ").unwrap().trim_end()).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "a dog");
    }
}
