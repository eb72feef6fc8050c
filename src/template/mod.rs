//! Template loading: typed records plus a hot-reloading store

pub mod store;
pub mod types;

pub use store::TemplateStore;
pub use types::{PromptBlueprint, RegexRule, RuleAction, TemplateLoadError, TemplateSet};
