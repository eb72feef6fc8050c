//! Wire types for OpenAI-compatible chat completion requests

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Inbound chat completion request body
///
/// Only `model`, `messages` and `stream` are honored; every other field the
/// client sends lands in `extra` so the handler can log what it ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ChatRequest {
    /// Names of client-supplied fields this proxy ignores (generation
    /// parameters come from operator config instead).
    pub fn ignored_params(&self) -> Vec<&str> {
        self.extra.keys().map(String::as_str).collect()
    }
}

/// Message role in a chat conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageBody>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        debug!("Message::user: called");
        Self {
            role: Role::User,
            content: Some(MessageBody::Text(content.into())),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        debug!("Message::assistant: called");
        Self {
            role: Role::Assistant,
            content: Some(MessageBody::Text(content.into())),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        debug!("Message::system: called");
        Self {
            role: Role::System,
            content: Some(MessageBody::Text(content.into())),
        }
    }
}

/// Message content - either a plain string or an array of typed parts
///
/// The OpenAI API accepts both forms; multimodal clients send the array form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageBody {
    /// True for an empty string or an empty part list
    pub fn is_empty(&self) -> bool {
        match self {
            MessageBody::Text(text) => text.is_empty(),
            MessageBody::Parts(parts) => parts.is_empty(),
        }
    }

    /// The first textual content in this body, if any
    pub fn first_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            MessageBody::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Other(_) => None,
            }),
        }
    }
}

/// One element of a structured content array
///
/// Text parts are the only kind this proxy inspects; anything else
/// (image_url, input_audio, ...) passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(untagged)]
    Other(Value),
}
