//! Ordered regex rule application over response text
//!
//! Rules run in template order, each over the previous rule's output. A rule
//! that cannot be applied (bad pattern, bad payload) is skipped with a
//! warning; the chain never aborts.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::template::{RegexRule, RuleAction};

/// Field that JSON payload rules write into the working object
pub const TOOL_OUTPUT_KEY: &str = "tool_code_interpreter_output";

/// Reasons a single rule can fail to apply
#[derive(Debug, Error)]
pub enum RuleApplicationError {
    #[error("invalid pattern '{pattern}': {source}")]
    BadPattern { pattern: String, source: regex::Error },

    #[error("replacement is not valid JSON: {0}")]
    BadPayload(#[from] serde_json::Error),

    #[error("replacement JSON has no 'payload' key")]
    MissingPayload,

    #[error("working text is valid JSON but not an object")]
    NotAnObject,
}

/// Apply every rule in order, skipping the ones that fail
pub fn apply(text: &str, rules: &[RegexRule]) -> String {
    if rules.is_empty() || text.is_empty() {
        return text.to_string();
    }
    debug!(rules = rules.len(), len = text.len(), "rules::apply: called");

    let mut current = text.to_string();
    for (idx, rule) in rules.iter().enumerate() {
        match apply_rule(&current, rule) {
            Ok(next) => current = next,
            Err(err) => {
                warn!(rule = idx + 1, find = %rule.find, error = %err, "skipping regex rule");
            }
        }
    }
    current
}

/// Apply one rule to the working text
pub fn apply_rule(text: &str, rule: &RegexRule) -> Result<String, RuleApplicationError> {
    match rule.action {
        RuleAction::Replace => {
            let re = regex::Regex::new(&rule.find).map_err(|source| RuleApplicationError::BadPattern {
                pattern: rule.find.clone(),
                source,
            })?;
            let replacement = translate_replacement(&rule.replace);
            Ok(re.replace_all(text, replacement.as_str()).into_owned())
        }
        RuleAction::JsonPayloadInject => inject_payload(text, &rule.replace),
    }
}

/// Parse the rule's replacement as JSON and write its `payload` into the
/// working text's object form under [`TOOL_OUTPUT_KEY`]
fn inject_payload(text: &str, replace: &str) -> Result<String, RuleApplicationError> {
    let replacement: Value = serde_json::from_str(replace)?;
    let payload = replacement
        .get("payload")
        .cloned()
        .ok_or(RuleApplicationError::MissingPayload)?;

    let mut working = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(RuleApplicationError::NotAnObject),
        Err(_) => {
            debug!("inject_payload: working text is not JSON, starting from empty object");
            serde_json::Map::new()
        }
    };

    working.insert(TOOL_OUTPUT_KEY.to_string(), payload);
    Ok(serde_json::to_string_pretty(&Value::Object(working))?)
}

/// Rewrite Python-style `\N` backreferences to the regex crate's `$N` form
///
/// Literal `$` is escaped as `$$` and `\\` collapses to a literal backslash.
fn translate_replacement(replace: &str) -> String {
    let mut out = String::with_capacity(replace.len());
    let mut chars = replace.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek() {
                Some(d) if d.is_ascii_digit() => {
                    out.push_str("${");
                    while let Some(d) = chars.peek().filter(|c| c.is_ascii_digit()) {
                        out.push(*d);
                        chars.next();
                    }
                    out.push('}');
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}
