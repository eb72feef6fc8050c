//! Message preparation: template selection, history splicing, user input
//! substitution, variable expansion and message normalization
//!
//! This is the heart of the proxy. An inbound message list is split into
//! historic messages and the trailing user input, a template is selected by
//! whether that input exists, and the template's blueprints are instantiated
//! around the history before normalization passes clean up the result.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::message::{ChatRequest, ContentPart, Message, MessageBody, Role};
use crate::template::{PromptBlueprint, RegexRule, TemplateStore};
use crate::vars;

/// Placeholder in template text that receives the client's last user input
pub const USER_INPUT_VAR: &str = "{{user_input}}";

/// Output of preparation: what to send upstream and which rules to apply to
/// the response
///
/// The rule list is captured here, once, so a template hot-reload between
/// request and response cannot change which rules process this response.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub regex_rules: Vec<RegexRule>,
}

/// Builds upstream message lists from inbound requests and templates
#[derive(Debug)]
pub struct MessagePreparer {
    store: Arc<TemplateStore>,
    with_input: PathBuf,
    without_input: PathBuf,
}

impl MessagePreparer {
    pub fn new(store: Arc<TemplateStore>, with_input: PathBuf, without_input: PathBuf) -> Self {
        debug!(
            with_input = %with_input.display(),
            without_input = %without_input.display(),
            "MessagePreparer::new: called"
        );
        Self {
            store,
            with_input,
            without_input,
        }
    }

    /// Run the full preparation pipeline over an inbound request
    pub fn prepare(&self, request: &ChatRequest) -> PreparedRequest {
        debug!(messages = request.messages.len(), "MessagePreparer::prepare: called");

        if request.model.is_none() {
            warn!("request has no model, passing through without one");
        }

        let (historic, last_user_input) = split_input(&request.messages);
        let last_user_text = last_user_input
            .and_then(MessageBody::first_text)
            .unwrap_or("");

        // Template selection keys off whether the trailing user message has
        // any usable text, not merely whether it exists.
        let template_path = if last_user_text.trim().is_empty() {
            &self.without_input
        } else {
            &self.with_input
        };
        debug!(template = %template_path.display(), "MessagePreparer::prepare: selected template");

        let blueprints = self.store.blueprints(template_path);
        let regex_rules = self.store.regex_rules(template_path);

        let built = if blueprints.is_empty() {
            build_without_template(&request.messages, historic, last_user_input)
        } else {
            build_from_blueprints(&blueprints, historic, last_user_input, last_user_text)
        };

        let expanded: Vec<Message> = built
            .into_iter()
            .map(|msg| Message {
                role: msg.role,
                content: msg.content.map(vars::expand_body),
            })
            .collect();

        let filtered: Vec<Message> = expanded
            .into_iter()
            .filter(|msg| msg.content.as_ref().is_some_and(|body| !body.is_empty()))
            .collect();

        let messages = merge_adjacent(filtered);
        debug!(messages = messages.len(), rules = regex_rules.len(), "MessagePreparer::prepare: done");

        PreparedRequest {
            model: request.model.clone(),
            messages,
            regex_rules,
        }
    }
}

/// Split the inbound list into historic messages and the trailing user input
///
/// Only a trailing `user` message counts as input; a user message elsewhere
/// is history like everything before it.
fn split_input(messages: &[Message]) -> (&[Message], Option<&MessageBody>) {
    match messages.split_last() {
        Some((last, rest)) if last.role == Role::User => (rest, last.content.as_ref()),
        _ => (messages, None),
    }
}

/// No usable template: forward the history, re-appending any user input
fn build_without_template(
    original: &[Message],
    historic: &[Message],
    last_user_input: Option<&MessageBody>,
) -> Vec<Message> {
    debug!("build_without_template: called");
    let mut built: Vec<Message> = historic.to_vec();
    if let Some(input) = last_user_input {
        built.push(Message {
            role: Role::User,
            content: Some(input.clone()),
        });
    }
    if built.is_empty() && !original.is_empty() {
        // History was empty and the trailing user message had no content;
        // forward the original list rather than sending nothing.
        built = original.to_vec();
    }
    built
}

/// Instantiate each blueprint, splicing history and substituting user input
fn build_from_blueprints(
    blueprints: &[PromptBlueprint],
    historic: &[Message],
    last_user_input: Option<&MessageBody>,
    last_user_text: &str,
) -> Vec<Message> {
    debug!(blueprints = blueprints.len(), "build_from_blueprints: called");

    let mut built = Vec::with_capacity(blueprints.len() + historic.len());
    let mut input_consumed = false;

    for blueprint in blueprints {
        match blueprint {
            PromptBlueprint::HistoryPlaceholder => {
                built.extend(historic.iter().cloned());
            }
            PromptBlueprint::Message { role, content } => {
                let content = match content {
                    Some(MessageBody::Text(tpl)) if tpl.contains(USER_INPUT_VAR) => {
                        if *role == Role::User {
                            input_consumed = true;
                            Some(substitute_user_input(tpl, last_user_input))
                        } else {
                            Some(MessageBody::Text(tpl.replace(USER_INPUT_VAR, last_user_text)))
                        }
                    }
                    other => other.clone(),
                };
                built.push(Message { role: *role, content });
            }
        }
    }

    // A template that never consumed the user's input must not drop it.
    if !input_consumed && let Some(input) = last_user_input {
        debug!("build_from_blueprints: template did not consume user input, appending it");
        built.push(Message {
            role: Role::User,
            content: Some(input.clone()),
        });
    }

    built
}

/// Replace `{{user_input}}` in a user blueprint with the client's input
///
/// Plain-string input substitutes textually. Multimodal input splices the
/// part list into the template text at the placeholder position.
fn substitute_user_input(template: &str, input: Option<&MessageBody>) -> MessageBody {
    match input {
        Some(MessageBody::Parts(parts)) => splice_parts(template, parts),
        Some(MessageBody::Text(text)) => MessageBody::Text(template.replace(USER_INPUT_VAR, text)),
        None => MessageBody::Text(template.replace(USER_INPUT_VAR, "")),
    }
}

fn splice_parts(template: &str, parts: &[ContentPart]) -> MessageBody {
    let (before, after) = template.split_once(USER_INPUT_VAR).unwrap_or((template, ""));

    let mut spliced = Vec::with_capacity(parts.len() + 2);
    if !before.is_empty() {
        spliced.push(ContentPart::Text {
            text: before.to_string(),
        });
    }
    spliced.extend(parts.iter().cloned());
    if !after.is_empty() {
        spliced.push(ContentPart::Text {
            text: after.to_string(),
        });
    }
    MessageBody::Parts(spliced)
}

/// Merge adjacent same-role messages whose contents are both plain strings
///
/// Multimodal messages never merge; they act as boundaries.
fn merge_adjacent(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        let mergeable = matches!(
            (merged.last(), &msg),
            (Some(prev), next)
                if prev.role == next.role
                    && matches!(prev.content, Some(MessageBody::Text(_)))
                    && matches!(next.content, Some(MessageBody::Text(_)))
        );
        if mergeable
            && let Some(Message {
                content: Some(MessageBody::Text(prev_text)),
                ..
            }) = merged.last_mut()
            && let Some(MessageBody::Text(next_text)) = &msg.content
        {
            prev_text.push('\n');
            prev_text.push_str(next_text);
        } else {
            merged.push(msg);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        preparer: MessagePreparer,
    }

    fn fixture(with_input: &str, without_input: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let with_path = dir.path().join("with_input.yaml");
        let without_path = dir.path().join("without_input.yaml");
        fs::write(&with_path, with_input).unwrap();
        fs::write(&without_path, without_input).unwrap();
        let preparer = MessagePreparer::new(Arc::new(TemplateStore::new()), with_path, without_path);
        Fixture { _dir: dir, preparer }
    }

    fn request(messages: serde_json::Value) -> ChatRequest {
        serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": messages
        }))
        .unwrap()
    }

    fn texts(prepared: &PreparedRequest) -> Vec<(Role, String)> {
        prepared
            .messages
            .iter()
            .map(|m| {
                (
                    m.role,
                    m.content
                        .as_ref()
                        .and_then(MessageBody::first_text)
                        .unwrap_or("")
                        .to_string(),
                )
            })
            .collect()
    }

    const WITH_INPUT: &str = r#"
- role: system
  content: "You are a pirate."
- type: history-placeholder
- role: user
  content: "Arr! {{user_input}}"
"#;

    #[test]
    fn test_scenario_template_wraps_history_and_input() {
        let fx = fixture(WITH_INPUT, "[]");
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "user", "content": "tell me a joke"}
        ])));
        assert_eq!(
            texts(&prepared),
            vec![
                (Role::System, "You are a pirate.".to_string()),
                (Role::User, "hi".to_string()),
                (Role::Assistant, "hello".to_string()),
                (Role::User, "Arr! tell me a joke".to_string()),
            ]
        );
        assert_eq!(prepared.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_scenario_no_trailing_user_selects_without_input_template() {
        let fx = fixture(
            WITH_INPUT,
            r#"
- role: system
  content: "Continue the story."
- type: history-placeholder
"#,
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "once upon a time"},
            {"role": "assistant", "content": "there was a fox"}
        ])));
        assert_eq!(
            texts(&prepared),
            vec![
                (Role::System, "Continue the story.".to_string()),
                (Role::User, "once upon a time".to_string()),
                (Role::Assistant, "there was a fox".to_string()),
            ]
        );
    }

    #[test]
    fn test_whitespace_only_input_counts_as_no_input() {
        let fx = fixture(
            WITH_INPUT,
            r#"
- role: system
  content: "no-input template"
"#,
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "   "}
        ])));
        // Without-input template selected; whitespace input still appended
        // since that template never consumes it, then kept (non-empty).
        assert_eq!(
            texts(&prepared),
            vec![
                (Role::System, "no-input template".to_string()),
                (Role::User, "   ".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_template_forwards_messages_verbatim() {
        let fx = fixture("[]", "[]");
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "system", "content": "sys"},
            {"role": "user", "content": "question"}
        ])));
        assert_eq!(
            texts(&prepared),
            vec![
                (Role::System, "sys".to_string()),
                (Role::User, "question".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_template_files_forward_messages() {
        let dir = TempDir::new().unwrap();
        let preparer = MessagePreparer::new(
            Arc::new(TemplateStore::new()),
            dir.path().join("absent_with.yaml"),
            dir.path().join("absent_without.yaml"),
        );
        let prepared = preparer.prepare(&request(json!([
            {"role": "user", "content": "still works"}
        ])));
        assert_eq!(texts(&prepared), vec![(Role::User, "still works".to_string())]);
        assert!(prepared.regex_rules.is_empty());
    }

    #[test]
    fn test_unconsumed_input_is_appended() {
        let fx = fixture(
            r#"
- role: system
  content: "No input slot here."
- type: history-placeholder
"#,
            "[]",
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "my question"}
        ])));
        assert_eq!(
            texts(&prepared),
            vec![
                (Role::System, "No input slot here.".to_string()),
                (Role::User, "my question".to_string()),
            ]
        );
    }

    #[test]
    fn test_non_user_blueprint_substitutes_input_textually() {
        let fx = fixture(
            r#"
- role: system
  content: "The user said: {{user_input}}"
- role: user
  content: "{{user_input}}"
"#,
            "[]",
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "ping"}
        ])));
        assert_eq!(
            texts(&prepared),
            vec![
                (Role::System, "The user said: ping".to_string()),
                (Role::User, "ping".to_string()),
            ]
        );
    }

    #[test]
    fn test_multimodal_input_splices_into_template() {
        let fx = fixture(WITH_INPUT, "[]");
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": [
                {"type": "text", "text": "describe this"},
                {"type": "image_url", "image_url": {"url": "data:,x"}}
            ]}
        ])));
        let Some(MessageBody::Parts(parts)) = &prepared.messages.last().unwrap().content else {
            panic!("expected spliced parts");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts[0],
            ContentPart::Text {
                text: "Arr! ".to_string()
            }
        );
        assert_eq!(
            parts[1],
            ContentPart::Text {
                text: "describe this".to_string()
            }
        );
        assert!(matches!(parts[2], ContentPart::Other(_)));
    }

    #[test]
    fn test_empty_messages_are_dropped() {
        let fx = fixture(
            r#"
- role: system
  content: ""
- role: user
  content: "{{user_input}}"
"#,
            "[]",
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "hi"}
        ])));
        assert_eq!(texts(&prepared), vec![(Role::User, "hi".to_string())]);
    }

    #[test]
    fn test_adjacent_same_role_strings_merge() {
        let fx = fixture(
            r#"
- role: system
  content: "first"
- role: system
  content: "second"
- role: user
  content: "{{user_input}}"
"#,
            "[]",
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "go"}
        ])));
        assert_eq!(
            texts(&prepared),
            vec![
                (Role::System, "first\nsecond".to_string()),
                (Role::User, "go".to_string()),
            ]
        );
    }

    #[test]
    fn test_multimodal_messages_do_not_merge() {
        let msgs = vec![
            Message::user("a"),
            Message {
                role: Role::User,
                content: Some(MessageBody::Parts(vec![ContentPart::Text {
                    text: "b".to_string(),
                }])),
            },
            Message::user("c"),
        ];
        let merged = merge_adjacent(msgs);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_variables_expand_in_template_output() {
        let fx = fixture(
            r#"
- role: system
  content: "Roll: {{roll 1d1}}"
- role: user
  content: "{{user_input}}"
"#,
            "[]",
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "hi"}
        ])));
        assert_eq!(texts(&prepared)[0].1, "Roll: 1");
    }

    #[test]
    fn test_regex_rules_are_captured() {
        let fx = fixture(
            r#"
- role: user
  content: "{{user_input}}"
- type: regex
  find: "a"
  replace: "b"
"#,
            "[]",
        );
        let prepared = fx.preparer.prepare(&request(json!([
            {"role": "user", "content": "x"}
        ])));
        assert_eq!(prepared.regex_rules.len(), 1);
    }

    #[test]
    fn test_prepare_is_idempotent_without_random_vars() {
        let fx = fixture(WITH_INPUT, "[]");
        let req = request(json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "yo"},
            {"role": "user", "content": "again"}
        ]));
        let first = fx.preparer.prepare(&req);
        let second = fx.preparer.prepare(&req);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_request_with_empty_template() {
        let fx = fixture("[]", "[]");
        let prepared = fx.preparer.prepare(&request(json!([])));
        assert!(prepared.messages.is_empty());
    }

    #[test]
    fn test_split_input_only_trailing_user_counts() {
        let msgs = vec![Message::user("early"), Message::assistant("reply")];
        let (historic, input) = split_input(&msgs);
        assert_eq!(historic.len(), 2);
        assert!(input.is_none());
    }
}
