// src/utils/config.rs
use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Programmatic configuration overrides. An option set here wins over the
/// process environment; unsetting falls back to the environment again.
static OPTIONS: Lazy<RwLock<HashMap<String, String>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Set or clear a process-wide configuration option.
pub fn set_option(key: &str, value: Option<&str>) {
    let mut options = OPTIONS.write();
    match value {
        Some(value) => {
            options.insert(key.to_string(), value.to_string());
        }
        None => {
            options.remove(key);
        }
    }
}

/// Look up a configuration option, falling back to the environment, then to
/// `default`.
pub fn get_option(key: &str, default: &str) -> String {
    if let Some(value) = OPTIONS.read().get(key) {
        return value.clone();
    }
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Integer configuration option; unparsable values yield `default`.
pub fn get_int_option(key: &str, default: i64) -> i64 {
    get_option(key, "")
        .trim()
        .parse::<i64>()
        .unwrap_or(default)
}
