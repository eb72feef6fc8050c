//! SSE frame construction for chat completion chunks
//!
//! Every frame is a fully serialized `data: <json>\n\n` string; the emulator
//! and the relay both write these straight to the response body.

use serde_json::{Value, json};
use uuid::Uuid;

/// Terminal sentinel every stream ends with, exactly once
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Model name used in heartbeat frames when the request carried none
pub const FALLBACK_MODEL: &str = "gpt-3.5-turbo-proxy";

/// Current unix timestamp for `created` fields
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Synthetic id for responses/chunks the upstream did not identify
pub fn synthetic_id(prefix: &str) -> String {
    format!("chatcmpl-{prefix}-{}-{}", unix_now(), Uuid::new_v4().simple())
}

/// Wrap a JSON value as one SSE data frame
pub fn data_frame(value: &Value) -> String {
    format!("data: {value}\n\n")
}

fn chunk(id: &str, model: &str, created: i64, delta: Value, finish_reason: Value) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

/// Empty-content chunk keeping the client connection alive
pub fn heartbeat_frame(model: &str) -> String {
    let now = unix_now();
    let id = format!("chatcmpl-hb-{now}");
    data_frame(&chunk(&id, model, now, json!({"content": ""}), Value::Null))
}

/// Chunk announcing the assistant role
pub fn role_frame(id: &str, model: &str, created: i64, role: &str) -> String {
    data_frame(&chunk(id, model, created, json!({"role": role}), Value::Null))
}

/// Chunk carrying response content
pub fn content_frame(id: &str, model: &str, created: i64, content: &Value) -> String {
    data_frame(&chunk(id, model, created, json!({"content": content}), Value::Null))
}

/// Chunk carrying the finish reason, with an empty delta
pub fn finish_frame(id: &str, model: &str, created: i64, finish_reason: &str) -> String {
    data_frame(&chunk(id, model, created, json!({}), json!(finish_reason)))
}

/// Typed error frame; `code` is the upstream HTTP status when one exists
pub fn error_frame(message: &str, code: Option<u16>, kind: &str) -> String {
    let mut error = json!({
        "message": message,
        "type": kind,
    });
    if let (Some(code), Some(map)) = (code, error.as_object_mut()) {
        map.insert("code".to_string(), json!(code));
    }
    data_frame(&json!({"error": error}))
}
