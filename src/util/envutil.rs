//! Environment list composition.
//!
//! Child process environments are carried around as ordered `KEY=VAL` lists
//! so that adapters and runners can compose them without touching the
//! process-wide environment.

use crate::{CifuzzError, CifuzzResult};

/// Returns the value of `key` in `env`, or an empty string if unset.
pub fn getenv(env: &[String], key: &str) -> String {
    let prefix = format!("{key}=");
    env.iter()
        .rev()
        .find_map(|e| e.strip_prefix(&prefix))
        .unwrap_or_default()
        .to_string()
}

/// Sets `key` to `value` in `env`, replacing an existing entry in place and
/// appending otherwise.
pub fn setenv(env: Vec<String>, key: &str, value: &str) -> CifuzzResult<Vec<String>> {
    if key.is_empty() || key.contains('=') {
        return Err(CifuzzError::Internal(format!(
            "invalid environment variable name {key:?}"
        )));
    }
    let mut env = env;
    let prefix = format!("{key}=");
    for entry in env.iter_mut() {
        if entry.starts_with(&prefix) {
            *entry = format!("{key}={value}");
            return Ok(env);
        }
    }
    env.push(format!("{key}={value}"));
    Ok(env)
}

/// Splits a `KEY=VAL` string into its parts.
pub fn split_key_value(entry: &str) -> CifuzzResult<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(CifuzzError::Usage(format!(
            "invalid environment variable, must be of the form KEY=VAL: {entry}"
        ))),
    }
}

/// Appends `elements` to a PATH-style list, skipping entries that are
/// already present.
pub fn append_to_path_list(list: &str, elements: &[String]) -> String {
    let sep = path_list_separator();
    let mut parts: Vec<String> = list
        .split(sep)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    for element in elements {
        if !parts.iter().any(|p| p == element) {
            parts.push(element.clone());
        }
    }
    parts.join(&sep.to_string())
}

/// The current process environment as a `KEY=VAL` list.
pub fn current_env() -> Vec<String> {
    std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
}

fn path_list_separator() -> char {
    if cfg!(windows) {
        ';'
    } else {
        ':'
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setenv_replaces_existing_entries() {
        let env = vec!["FOO=1".to_string(), "BAR=2".to_string()];
        let env = setenv(env, "FOO", "3").unwrap();
        assert_eq!(env, vec!["FOO=3".to_string(), "BAR=2".to_string()]);
    }

    #[test]
    fn setenv_appends_missing_entries() {
        let env = setenv(vec!["FOO=1".to_string()], "BAZ", "3").unwrap();
        assert_eq!(env, vec!["FOO=1".to_string(), "BAZ=3".to_string()]);
    }

    #[test]
    fn getenv_returns_latest_value() {
        let env = vec!["FOO=1".to_string()];
        assert_eq!(getenv(&env, "FOO"), "1");
        assert_eq!(getenv(&env, "MISSING"), "");
    }

    #[test]
    fn split_key_value_rejects_entries_without_value() {
        assert!(split_key_value("FOO").is_err());
        assert!(split_key_value("=bar").is_err());
        assert_eq!(split_key_value("FOO=bar").unwrap(), ("FOO", "bar"));
        assert_eq!(split_key_value("FOO=a=b").unwrap(), ("FOO", "a=b"));
    }

    #[test]
    fn append_to_path_list_deduplicates() {
        let list = append_to_path_list("/a", &["/b".to_string(), "/a".to_string()]);
        assert_eq!(list, format!("/a{}/b", if cfg!(windows) { ';' } else { ':' }));
    }
}
