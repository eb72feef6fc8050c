//! Template variable expansion: dice rolls and random choices
//!
//! `{{roll XdY}}` becomes the sum of X rolls of a Y-sided die and
//! `{{random::a::b}}` becomes one of the listed options. Bad input never
//! fails expansion; an error marker is embedded in the output instead so
//! template authors can spot the mistake in the conversation itself.

use std::borrow::Cow;
use std::sync::LazyLock;

use rand::Rng;
use rand::seq::IndexedRandom;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::message::{ContentPart, MessageBody};

static DICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{roll\s*(\d+)\s*d\s*(\d+)\s*\}\}").unwrap_or_else(|e| panic!("dice regex: {e}"))
});

static RANDOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{random::(.*?)\}\}").unwrap_or_else(|e| panic!("random regex: {e}"))
});

/// Expand all `{{roll XdY}}` placeholders in `text`
pub fn expand_dice(text: &str) -> String {
    DICE_RE
        .replace_all(text, |caps: &Captures| {
            let count_s = &caps[1];
            let sides_s = &caps[2];
            let (Ok(count), Ok(sides)) = (count_s.parse::<u64>(), sides_s.parse::<u64>()) else {
                warn!(count = count_s, sides = sides_s, "dice parameters out of range");
                return format!("{{roll {count_s}d{sides_s} - non-integer dice parameters}}");
            };
            if count == 0 || sides == 0 {
                warn!(count, sides, "dice parameters must be positive");
                return format!("{{roll {count}d{sides} - invalid dice parameters}}");
            }
            let mut rng = rand::rng();
            let total: u64 = (0..count).map(|_| rng.random_range(1..=sides)).sum();
            debug!(count, sides, total, "expand_dice: rolled");
            total.to_string()
        })
        .into_owned()
}

/// Expand all `{{random::a::b}}` placeholders in `text`
pub fn expand_random(text: &str) -> String {
    RANDOM_RE
        .replace_all(text, |caps: &Captures| {
            let raw = &caps[1];
            if raw.is_empty() {
                warn!("random placeholder with no options");
                return "{random:: - no options}".to_string();
            }
            let options: Vec<&str> = raw.split("::").filter(|opt| !opt.is_empty()).collect();
            match options.choose(&mut rand::rng()) {
                Some(choice) => {
                    debug!(options = options.len(), choice, "expand_random: chose");
                    (*choice).to_string()
                }
                None => {
                    warn!(raw, "random placeholder with only empty options");
                    "{random:: - no valid options}".to_string()
                }
            }
        })
        .into_owned()
}

/// Expand dice then random placeholders in `text`
pub fn expand_text(text: &str) -> Cow<'_, str> {
    if !text.contains("{{") {
        return Cow::Borrowed(text);
    }
    Cow::Owned(expand_random(&expand_dice(text)))
}

/// Expand variables in a message body
///
/// Plain strings and `text`-typed parts are expanded; other structured parts
/// (images, audio) pass through untouched.
pub fn expand_body(body: MessageBody) -> MessageBody {
    match body {
        MessageBody::Text(text) => MessageBody::Text(expand_text(&text).into_owned()),
        MessageBody::Parts(parts) => MessageBody::Parts(
            parts
                .into_iter()
                .map(|part| match part {
                    ContentPart::Text { text } => ContentPart::Text {
                        text: expand_text(&text).into_owned(),
                    },
                    other => other,
                })
                .collect(),
        ),
    }
}
