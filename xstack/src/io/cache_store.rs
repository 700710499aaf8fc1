//! Content-addressed per-runner result cache.
//!
//! Entries live at `<cache_root>/<runner_id>/<key_hash>.json`. A miss is a
//! normal outcome; read and write failures are logged and degrade to a miss
//! or a skipped store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::canonical::sha256_hex;
use crate::core::types::CacheEntry;
use crate::io::fs_util::{read_json, write_canonical_json};

/// Top-level cache directories that never hold runner entries.
pub const RESERVED_DIRS: &[&str] = &["merkle", "plans", "ledger", "artifacts"];

/// Every component of a cache key; altering any of them is a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey<'a> {
    pub runner_id: &'a str,
    pub input_hash: &'a str,
    pub profile_id: &'a str,
    pub tool_version: &'a str,
}

impl CacheKey<'_> {
    pub fn key_hash(&self) -> String {
        sha256_hex(format!(
            "{}|{}|{}|{}",
            self.runner_id, self.input_hash, self.profile_id, self.tool_version
        ))
    }

    fn matches(&self, entry: &CacheEntry) -> bool {
        entry.runner_id == self.runner_id
            && entry.input_hash == self.input_hash
            && entry.profile_id == self.profile_id
            && entry.tool_version == self.tool_version
    }
}

/// Directory name for a runner's entries.
pub fn runner_dir_name(runner_id: &str) -> String {
    runner_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

pub fn entry_path(cache_root: &Path, key: &CacheKey<'_>) -> PathBuf {
    cache_root
        .join(runner_dir_name(key.runner_id))
        .join(format!("{}.json", key.key_hash()))
}

/// Look up `key`; any mismatch or read failure is a miss.
pub fn load_entry(cache_root: &Path, key: &CacheKey<'_>) -> Option<CacheEntry> {
    let path = entry_path(cache_root, key);
    if !path.exists() {
        return None;
    }
    match read_json::<CacheEntry>(&path) {
        Ok(entry) if key.matches(&entry) => Some(entry),
        Ok(_) => {
            debug!(path = %path.display(), "cache entry key mismatch");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), err = %format!("{err:#}"), "unreadable cache entry");
            None
        }
    }
}

/// Persist `entry`; returns the written path, or `None` when the write failed.
pub fn store_entry(cache_root: &Path, entry: &CacheEntry) -> Option<PathBuf> {
    let key = CacheKey {
        runner_id: &entry.runner_id,
        input_hash: &entry.input_hash,
        profile_id: &entry.profile_id,
        tool_version: &entry.tool_version,
    };
    let path = entry_path(cache_root, &key);
    let mut record = entry.clone();
    record.artifacts_produced.sort();
    record.artifacts_produced.dedup();
    match write_canonical_json(&path, &record) {
        Ok(()) => Some(path),
        Err(err) => {
            warn!(path = %path.display(), err = %format!("{err:#}"), "cache store failed");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Fresh,
    /// Recorded tool version differs from the current one.
    Stale,
    /// The runner no longer has a tool version at all.
    Retired,
    Unreadable,
}

impl EntryStatus {
    pub fn is_removable(self) -> bool {
        self != Self::Fresh
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedEntry {
    pub path: PathBuf,
    pub runner_id: String,
    pub recorded_version: String,
    pub current_version: Option<String>,
    pub status: EntryStatus,
}

/// Classify every cache entry against `current_version(runner_id)`.
pub fn scan_stale_entries<F>(cache_root: &Path, current_version: F) -> Result<Vec<ScannedEntry>>
where
    F: Fn(&str) -> Option<String>,
{
    if !cache_root.is_dir() {
        return Ok(Vec::new());
    }
    let walker = WalkDir::new(cache_root)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !entry.file_type().is_dir()
                || !RESERVED_DIRS.contains(&entry.file_name().to_string_lossy().as_ref())
        });

    let mut scanned = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("scan {}", cache_root.display()))?;
        let name = entry.file_name().to_string_lossy();
        if entry.depth() != 2
            || !entry.file_type().is_file()
            || !name.ends_with(".json")
            || name.starts_with('.')
        {
            continue;
        }
        let path = entry.path().to_path_buf();
        let dir_runner = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let record = match read_json::<CacheEntry>(&path) {
            Ok(record) => record,
            Err(_) => {
                scanned.push(ScannedEntry {
                    path,
                    runner_id: dir_runner,
                    recorded_version: String::new(),
                    current_version: None,
                    status: EntryStatus::Unreadable,
                });
                continue;
            }
        };
        let current = current_version(&record.runner_id).filter(|v| !v.trim().is_empty());
        let status = match &current {
            None => EntryStatus::Retired,
            Some(version) if *version == record.tool_version => EntryStatus::Fresh,
            Some(_) => EntryStatus::Stale,
        };
        scanned.push(ScannedEntry {
            path,
            runner_id: record.runner_id,
            recorded_version: record.tool_version,
            current_version: current,
            status,
        });
    }
    Ok(scanned)
}

/// Delete every non-fresh entry; returns how many were removed.
pub fn prune_stale_entries(scanned: &[ScannedEntry]) -> Result<usize> {
    let mut removed = 0;
    for entry in scanned.iter().filter(|e| e.status.is_removable()) {
        fs::remove_file(&entry.path)
            .with_context(|| format!("remove {}", entry.path.display()))?;
        removed += 1;
    }
    debug!(removed, "pruned cache entries");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(runner: &str, input: &str, profile: &str, version: &str) -> CacheEntry {
        CacheEntry {
            runner_id: runner.to_string(),
            input_hash: input.to_string(),
            profile_id: profile.to_string(),
            tool_version: version.to_string(),
            output_hash: "hash.output.a".to_string(),
            exit_code: 0,
            output: "ok\n".to_string(),
            artifacts_produced: vec!["docs/audit/proof_manifest.json".to_string()],
            timestamp_utc: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn key<'a>(
        runner: &'a str,
        input: &'a str,
        profile: &'a str,
        version: &'a str,
    ) -> CacheKey<'a> {
        CacheKey {
            runner_id: runner,
            input_hash: input,
            profile_id: profile,
            tool_version: version,
        }
    }

    #[test]
    fn profile_and_input_changes_miss() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stored = entry("repox_runner", "hash.input.a", "FAST", "repox-1");
        store_entry(temp.path(), &stored).expect("store");

        let hit = load_entry(temp.path(), &key("repox_runner", "hash.input.a", "FAST", "repox-1"));
        assert_eq!(hit, Some(stored));
        let misses = [
            key("repox_runner", "hash.input.a", "STRICT", "repox-1"),
            key("repox_runner", "hash.input.b", "FAST", "repox-1"),
            key("repox_runner", "hash.input.a", "FAST", "repox-2"),
        ];
        for miss in &misses {
            assert!(load_entry(temp.path(), miss).is_none(), "{miss:?}");
        }
    }

    #[test]
    fn recorded_failures_stay_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut failed = entry("testx.group.a", "in", "FAST", "testx-1");
        failed.exit_code = 3;
        store_entry(temp.path(), &failed).expect("store");
        let hit =
            load_entry(temp.path(), &key("testx.group.a", "in", "FAST", "testx-1")).expect("hit");
        assert_eq!(hit.exit_code, 3);
    }

    #[test]
    fn stored_file_is_canonical() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stored = entry("repox_runner", "in", "FAST", "repox-1");
        let path = store_entry(temp.path(), &stored).expect("store");
        assert!(path.starts_with(temp.path().join("repox_runner")));
        let body = fs::read_to_string(&path).expect("read");
        assert!(body.ends_with("}\n"));
        assert!(body.find("\"artifacts_produced\"") < body.find("\"exit_code\""));
    }

    #[test]
    fn tampered_entry_is_a_miss() {
        let temp = tempfile::tempdir().expect("tempdir");
        let k = key("repox_runner", "in", "FAST", "repox-1");
        let path = entry_path(temp.path(), &k);
        let other = entry("repox_runner", "other", "FAST", "repox-1");
        write_canonical_json(&path, &other).expect("write");
        assert!(load_entry(temp.path(), &k).is_none());
        fs::write(&path, "{").expect("corrupt");
        assert!(load_entry(temp.path(), &k).is_none());
    }

    #[test]
    fn scan_classifies_and_prune_removes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let store = |runner, version| {
            store_entry(root, &entry(runner, "a", "FAST", version)).expect("store")
        };
        let fresh = store("repox_runner", "repox-1");
        let stale = store("testx_runner", "testx-0");
        let retired = store("gone_runner", "gone-1");
        fs::create_dir_all(root.join("broken")).expect("mkdir");
        fs::write(root.join("broken/x.json"), "nope").expect("write");
        fs::create_dir_all(root.join("plans")).expect("mkdir");
        fs::write(root.join("plans/p.json"), "{}").expect("write");

        let scanned = scan_stale_entries(root, |runner| match runner {
            "repox_runner" => Some("repox-1".to_string()),
            "testx_runner" => Some("testx-1".to_string()),
            _ => None,
        })
        .expect("scan");
        let status_of = |path: &Path| {
            scanned
                .iter()
                .find(|e| e.path == path)
                .map(|e| e.status)
                .expect("scanned")
        };
        assert_eq!(scanned.len(), 4);
        assert_eq!(status_of(&fresh), EntryStatus::Fresh);
        assert_eq!(status_of(&stale), EntryStatus::Stale);
        assert_eq!(status_of(&retired), EntryStatus::Retired);
        assert_eq!(status_of(&root.join("broken/x.json")), EntryStatus::Unreadable);

        assert_eq!(prune_stale_entries(&scanned).expect("prune"), 3);
        assert!(fresh.exists());
        assert!(!stale.exists());
        assert!(root.join("plans/p.json").exists());
    }
}
