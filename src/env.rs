//! Child-process environment composition.
//!
//! The environment handed to the test runner is an ordered list of `KEY=VALUE`
//! entries. Composition is pure: the caller passes the base list explicitly
//! (usually captured once from [`std::env::vars_os`]) and gets a new list back,
//! so nothing here reads or mutates process-global state.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Ordered `KEY=VALUE` entries for a child process.
pub type EnvironmentList = Vec<String>;

/// Set `key` to `value` in `env`.
///
/// The first entry starting with `KEY=` is replaced in place; otherwise the pair
/// is appended. Unrelated entries keep their order.
pub fn putenv(mut env: EnvironmentList, key: &str, value: &str) -> EnvironmentList {
    let prefix = format!("{key}=");
    let entry = format!("{prefix}{value}");
    match env.iter().position(|existing| existing.starts_with(&prefix)) {
        Some(index) => env[index] = entry,
        None => env.push(entry),
    }
    env
}

/// Look up the value of `key` in `env` (first match wins, as in [`putenv`]).
pub fn lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        entry
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// Put `root` ahead of an existing path list.
///
/// An unset or empty `existing` value yields `root` alone.
pub fn prepend_search_path(root: &Path, existing: Option<&OsStr>) -> Result<OsString, std::env::JoinPathsError> {
    let mut paths = vec![root.to_path_buf()];
    if let Some(existing) = existing.filter(|value| !value.is_empty()) {
        paths.extend(std::env::split_paths(existing));
    }
    std::env::join_paths(paths)
}

/// Split a path-list value into its entries, dropping empty ones.
pub fn split_search_path(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

/// Build an [`EnvironmentList`] from `(key, value)` pairs.
///
/// Entries that are not valid UTF-8 cannot be represented; each one is skipped
/// with a warning, since the test runner's environment is cleared and rebuilt
/// from this list.
pub fn environ_list<I>(vars: I) -> EnvironmentList
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| match (key.to_str(), value.to_str()) {
            (Some(key), Some(value)) => Some(format!("{key}={value}")),
            _ => {
                tracing::warn!(
                    key = %key.to_string_lossy(),
                    "dropping non-UTF-8 environment entry from the test environment"
                );
                None
            }
        })
        .collect()
}

/// Split an [`EnvironmentList`] back into `(key, value)` pairs for `Command::envs`.
pub fn entries(env: &[String]) -> impl Iterator<Item = (&str, &str)> {
    env.iter().filter_map(|entry| entry.split_once('='))
}
