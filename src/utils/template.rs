//! String template rendering utilities.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z][A-Za-z0-9_]*)\s*\}\}").unwrap());

pub struct TemplateVars;

impl TemplateVars {
    pub const ITERATION: &'static str = "iteration";
    pub const START: &'static str = "start";
    pub const END: &'static str = "end";
    pub const SHARD: &'static str = "shard";
    pub const SHARDS: &'static str = "shards";
    pub const GROUP: &'static str = "group";
    pub const MODEL_TYPE: &'static str = "modelType";
    pub const SCORE_TYPE: &'static str = "scoreType";
    pub const FORCE: &'static str = "force";
    pub const CLEAN: &'static str = "clean";
    pub const ARTIFACTS: &'static str = "artifacts";
    pub const NAME: &'static str = "name";
    pub const WAIT_FOR: &'static str = "waitFor";
    pub const DEPENDENCIES: &'static str = "dependencies";
    pub const QUEUE: &'static str = "queue";
    pub const MEMORY: &'static str = "memory";
    pub const TIME: &'static str = "time";
    pub const EXTRA: &'static str = "extra";
    pub const COMMAND: &'static str = "command";
}

pub fn render_map(template: &str, variables: &HashMap<String, String>) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

/// Names of the `{{...}}` placeholders still left in `rendered`.
pub fn unresolved(rendered: &str) -> Vec<String> {
    PLACEHOLDER_PATTERN
        .captures_iter(rendered)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Whether `template` contains the `{{key}}` placeholder.
pub fn is_present(template: &str, key: &str) -> bool {
    let placeholder = format!("{{{{{}}}}}", key);
    template.contains(&placeholder)
}
