//! Promptgate - prompt-injecting reverse proxy for OpenAI-compatible APIs
//!
//! Sits between a chat client and any OpenAI-compatible upstream. Inbound
//! message lists are rebuilt from hot-reloading YAML templates (history
//! splicing, `{{user_input}}` substitution, dice/random variables), the
//! upstream call is made with operator-controlled generation parameters, and
//! responses are post-processed with per-template regex rules. Streaming
//! clients can be served either by a passthrough relay or by an emulated
//! stream that heartbeats while a non-streaming upstream call completes.

pub mod cli;
pub mod config;
pub mod emulator;
pub mod message;
pub mod prepare;
pub mod relay;
pub mod rules;
pub mod server;
pub mod sse;
pub mod template;
pub mod upstream;
pub mod vars;

pub use config::Config;
pub use message::{ChatRequest, ContentPart, Message, MessageBody, Role};
pub use prepare::{MessagePreparer, PreparedRequest};
pub use server::AppState;
pub use template::{PromptBlueprint, RegexRule, RuleAction, TemplateStore};
pub use upstream::{UpstreamClient, UpstreamError};
