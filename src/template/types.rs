//! Template file records: prompt blueprints and regex rules
//!
//! A template file is a YAML sequence. Each record is either a regex rule
//! (`type: regex`), a history placeholder (`type: history-placeholder`), or a
//! message skeleton with `role` and `content`. Malformed records are dropped
//! with a warning; file-level failures surface as [`TemplateLoadError`] so the
//! store can keep its last-known-good set.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{MessageBody, Role};

/// Errors that make an entire template file unusable
#[derive(Debug, Error)]
pub enum TemplateLoadError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("template root must be a sequence, got {0}")]
    NotASequence(String),
}

/// What to do with a regex rule's replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Standard find/replace over the working text
    Replace,
    /// Parse the replacement as JSON and inject its `payload` into the
    /// working text's `tool_code_interpreter_output` field
    JsonPayloadInject,
}

/// One ordered find/replace rule from a template file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexRule {
    pub find: String,
    pub replace: String,
    pub action: RuleAction,
}

/// One entry in a template's message sequence
#[derive(Debug, Clone, PartialEq)]
pub enum PromptBlueprint {
    /// Splice the client's historic messages in at this position
    HistoryPlaceholder,
    /// A message skeleton, possibly containing `{{user_input}}` and
    /// variable placeholders
    Message {
        role: Role,
        content: Option<MessageBody>,
    },
}

/// Everything parsed out of one template file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateSet {
    pub blueprints: Vec<PromptBlueprint>,
    pub rules: Vec<RegexRule>,
}

impl TemplateSet {
    /// Parse a template file's text into blueprints and rules
    pub fn parse(text: &str) -> Result<Self, TemplateLoadError> {
        debug!(len = text.len(), "TemplateSet::parse: called");

        let root: serde_yaml::Value = serde_yaml::from_str(text)?;
        if root.is_null() {
            // Empty file is a valid empty template
            return Ok(Self::default());
        }
        let serde_yaml::Value::Sequence(records) = root else {
            return Err(TemplateLoadError::NotASequence(type_name(&root)));
        };

        let mut set = Self::default();
        for (idx, record) in records.into_iter().enumerate() {
            let value = match serde_json::to_value(&record) {
                Ok(value) => value,
                Err(err) => {
                    warn!(record = idx + 1, error = %err, "skipping non-JSON-representable template record");
                    continue;
                }
            };
            let Some(object) = value.as_object() else {
                warn!(record = idx + 1, "skipping non-mapping template record");
                continue;
            };

            match object.get("type").and_then(Value::as_str) {
                Some("regex") => {
                    if let Some(rule) = parse_rule(idx, object) {
                        set.rules.push(rule);
                    }
                }
                Some("history-placeholder") => {
                    set.blueprints.push(PromptBlueprint::HistoryPlaceholder);
                }
                _ => {
                    if let Some(blueprint) = parse_message(idx, object) {
                        set.blueprints.push(blueprint);
                    }
                }
            }
        }

        debug!(
            blueprints = set.blueprints.len(),
            rules = set.rules.len(),
            "TemplateSet::parse: done"
        );
        Ok(set)
    }
}

fn parse_rule(idx: usize, object: &serde_json::Map<String, Value>) -> Option<RegexRule> {
    let find = object.get("find").and_then(scalar_to_string);
    let replace = object.get("replace").and_then(scalar_to_string);
    let (Some(find), Some(replace)) = (find, replace) else {
        warn!(record = idx + 1, "skipping regex rule without find/replace");
        return None;
    };

    let action = match object.get("action").and_then(Value::as_str) {
        None | Some("replace") => RuleAction::Replace,
        Some("json_payload") => RuleAction::JsonPayloadInject,
        Some(other) => {
            warn!(record = idx + 1, action = other, "skipping regex rule with unknown action");
            return None;
        }
    };

    Some(RegexRule { find, replace, action })
}

fn parse_message(idx: usize, object: &serde_json::Map<String, Value>) -> Option<PromptBlueprint> {
    let role = match object.get("role") {
        Some(value) => match serde_json::from_value::<Role>(value.clone()) {
            Ok(role) => role,
            Err(_) => {
                warn!(record = idx + 1, role = %value, "skipping template message with unknown role");
                return None;
            }
        },
        None => {
            warn!(record = idx + 1, "skipping template message without role");
            return None;
        }
    };

    let content = match object.get("content") {
        None | Some(Value::Null) => None,
        Some(value) => match serde_json::from_value::<MessageBody>(value.clone()) {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(record = idx + 1, error = %err, "skipping template message with invalid content");
                return None;
            }
        },
    };

    Some(PromptBlueprint::Message { role, content })
}

/// Template authors sometimes write bare numbers where a pattern string is
/// expected; coerce scalars instead of dropping the rule.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn type_name(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "sequence",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages_placeholder_and_rules() {
        let yaml = r#"
- role: system
  content: "You are helpful."
- type: history-placeholder
- role: user
  content: "{{user_input}}"
- type: regex
  find: "foo"
  replace: "bar"
"#;
        let set = TemplateSet::parse(yaml).unwrap();
        assert_eq!(set.blueprints.len(), 3);
        assert_eq!(set.blueprints[1], PromptBlueprint::HistoryPlaceholder);
        assert_eq!(
            set.rules,
            vec![RegexRule {
                find: "foo".to_string(),
                replace: "bar".to_string(),
                action: RuleAction::Replace,
            }]
        );
    }

    #[test]
    fn test_parse_json_payload_action() {
        let yaml = r#"
- type: regex
  find: ".*"
  replace: '{"payload": {"result": "ok"}}'
  action: json_payload
"#;
        let set = TemplateSet::parse(yaml).unwrap();
        assert_eq!(set.rules[0].action, RuleAction::JsonPayloadInject);
    }

    #[test]
    fn test_parse_coerces_scalar_find_replace() {
        let yaml = r#"
- type: regex
  find: 42
  replace: 7
"#;
        let set = TemplateSet::parse(yaml).unwrap();
        assert_eq!(set.rules[0].find, "42");
        assert_eq!(set.rules[0].replace, "7");
    }

    #[test]
    fn test_parse_drops_malformed_records() {
        let yaml = r#"
- type: regex
  find: "no replace here"
- role: narrator
  content: "unknown role"
- "just a string"
- role: user
  content: "kept"
"#;
        let set = TemplateSet::parse(yaml).unwrap();
        assert!(set.rules.is_empty());
        assert_eq!(set.blueprints.len(), 1);
        assert_eq!(
            set.blueprints[0],
            PromptBlueprint::Message {
                role: Role::User,
                content: Some(MessageBody::Text("kept".to_string())),
            }
        );
    }

    #[test]
    fn test_parse_unknown_action_drops_rule() {
        let yaml = r#"
- type: regex
  find: "a"
  replace: "b"
  action: transmogrify
"#;
        let set = TemplateSet::parse(yaml).unwrap();
        assert!(set.rules.is_empty());
    }

    #[test]
    fn test_parse_empty_file_is_empty_set() {
        let set = TemplateSet::parse("").unwrap();
        assert!(set.blueprints.is_empty());
        assert!(set.rules.is_empty());
    }

    #[test]
    fn test_parse_non_sequence_is_error() {
        let err = TemplateSet::parse("key: value").unwrap_err();
        assert!(matches!(err, TemplateLoadError::NotASequence(_)));
    }

    #[test]
    fn test_parse_invalid_yaml_is_error() {
        let err = TemplateSet::parse("- [unclosed").unwrap_err();
        assert!(matches!(err, TemplateLoadError::Yaml(_)));
    }

    #[test]
    fn test_parse_multimodal_template_content() {
        let yaml = r#"
- role: user
  content:
    - type: text
      text: "look at this"
"#;
        let set = TemplateSet::parse(yaml).unwrap();
        let PromptBlueprint::Message { content, .. } = &set.blueprints[0] else {
            panic!("expected message");
        };
        assert!(matches!(content, Some(MessageBody::Parts(_))));
    }
}
