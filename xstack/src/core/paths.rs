//! Repository-relative path helpers.
//!
//! All paths handled by the core are `/`-separated and relative to the repo
//! root, regardless of host platform.

use std::path::Path;

/// Top-level names skipped by every tree walk.
pub const FIXED_SKIP_NAMES: &[&str] = &[".git", ".vs", "__pycache__", ".xstack_cache"];

/// Normalize a repo-relative path: `/` separators, no leading `./` or `/`.
pub fn normalize_rel(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped.to_string();
    }
    path.trim_start_matches('/').trim_end_matches('/').to_string()
}

/// True when `path` equals `prefix` or lies underneath it.
///
/// `prefix` may carry a trailing `/`; comparison is component-aware so
/// `docs/audit` does not match `docs/auditx`.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// True for paths under `tools/*/cache/`.
pub fn is_tool_cache_path(path: &str) -> bool {
    let mut parts = path.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some("tools"), Some(_), Some("cache"))
    )
}

/// True when any component of `path` is a fixed skip name.
pub fn has_fixed_skip_component(path: &str) -> bool {
    path.split('/')
        .any(|component| FIXED_SKIP_NAMES.contains(&component))
}

/// First path component, or `""` for root-level files.
pub fn top_level_dir(path: &str) -> &str {
    match path.split_once('/') {
        Some((head, _)) => head,
        None => "",
    }
}

/// `path` relative to `root` as a normalized string.
///
/// `None` when `path` lies outside `root`; `Some("")` when they are equal.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Some(normalize_rel(&joined))
}
