//! Environment snapshots.
//!
//! Functions that read environment variables take an explicit [`Env`] so
//! tests never mutate the process environment.

use std::collections::BTreeMap;

/// Sorted environment snapshot.
pub type Env = BTreeMap<String, String>;

/// Snapshot the current process environment (non-UTF-8 entries are dropped).
pub fn capture_process_env() -> Env {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Non-blank value for `key`.
pub fn env_value<'a>(env: &'a Env, key: &str) -> Option<&'a str> {
    env.get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}
