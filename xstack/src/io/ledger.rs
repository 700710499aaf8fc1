//! Append-only, content-addressed execution ledger.
//!
//! Entries are written to `<cache_root>/ledger/<entry_hash>.json` and never
//! rewritten. Ledger failures are logged and never propagate.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::canonical::{canonical_hash, sha256_hex, to_sorted_value};
use crate::core::types::{ArtifactClass, LedgerEntry};
use crate::io::artifact_contract::ArtifactContract;
use crate::io::fs_util::{read_json, write_atomic, write_canonical_json};

pub const LEDGER_SCHEMA_VERSION: &str = "1.0.0";
const LEDGER_DIR: &str = "ledger";
const SHORT_HASH_LEN: usize = 12;

/// Inputs for one ledger entry; canonicalized by [`build_entry`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryInputs {
    pub repo_state_hash: String,
    pub plan_hash: String,
    pub profile: String,
    pub runner_ids: Vec<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub artifact_hashes: BTreeMap<String, String>,
    pub failure_class: String,
    pub duration_s: f64,
    pub workspace_id: String,
}

/// Where an entry landed. Both fields are empty when the write failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerRecord {
    pub path: Option<PathBuf>,
    pub entry_hash: String,
}

/// Canonicalize inputs and compute `entry_hash` over everything else.
pub fn build_entry(inputs: EntryInputs) -> Result<LedgerEntry> {
    let mut runner_ids = inputs.runner_ids;
    runner_ids.sort();
    runner_ids.dedup();
    let mut entry = LedgerEntry {
        schema_version: LEDGER_SCHEMA_VERSION.to_string(),
        repo_state_hash: inputs.repo_state_hash,
        plan_hash: inputs.plan_hash,
        profile: inputs.profile,
        runner_ids_executed: runner_ids,
        cache_hits: inputs.cache_hits,
        cache_misses: inputs.cache_misses,
        artifact_hashes: inputs.artifact_hashes,
        failure_class: inputs.failure_class,
        duration_s: round_millis(inputs.duration_s),
        workspace_id: inputs.workspace_id,
        entry_hash: String::new(),
    };
    entry.entry_hash = entry_hash(&entry)?;
    Ok(entry)
}

/// `sha256(canonical-json(entry without entry_hash))`.
pub fn entry_hash(entry: &LedgerEntry) -> Result<String> {
    let mut value = to_sorted_value(entry)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("entry_hash");
    }
    canonical_hash(&value)
}

fn round_millis(seconds: f64) -> f64 {
    if seconds.is_finite() {
        (seconds * 1000.0).round() / 1000.0
    } else {
        0.0
    }
}

/// Write `entry` under its hash. Never fails; a failed write yields an empty record.
pub fn append_entry(cache_root: &Path, entry: &LedgerEntry) -> LedgerRecord {
    match try_append(cache_root, entry) {
        Ok(record) => record,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "ledger append failed");
            LedgerRecord::default()
        }
    }
}

fn try_append(cache_root: &Path, entry: &LedgerEntry) -> Result<LedgerRecord> {
    let hash = entry_hash(entry)?;
    let path = cache_root.join(LEDGER_DIR).join(format!("{hash}.json"));
    if path.exists() {
        debug!(path = %path.display(), "ledger entry already recorded");
    } else {
        let mut record = entry.clone();
        record.entry_hash = hash.clone();
        write_canonical_json(&path, &record)?;
    }
    Ok(LedgerRecord {
        path: Some(path),
        entry_hash: hash,
    })
}

/// All readable entries sorted by `entry_hash`.
pub fn load_entries(cache_root: &Path) -> Vec<LedgerEntry> {
    let dir = cache_root.join(LEDGER_DIR);
    let read_dir = match fs::read_dir(&dir) {
        Ok(read_dir) => read_dir,
        Err(_) => return Vec::new(),
    };
    let mut entries = Vec::new();
    for item in read_dir.flatten() {
        let path = item.path();
        let is_entry = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .is_some_and(|name| name.ends_with(".json") && !name.starts_with('.'));
        if !is_entry {
            continue;
        }
        match read_json::<LedgerEntry>(&path) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(
                path = %path.display(),
                err = %format!("{err:#}"),
                "skipping ledger entry"
            ),
        }
    }
    entries.sort_by(|a, b| a.entry_hash.cmp(&b.entry_hash));
    entries
}

/// `{rel_path → sha256}` for the CANONICAL paths among `paths` that exist on disk.
pub fn canonical_artifact_hashes(
    repo_root: &Path,
    contract: &ArtifactContract,
    paths: &[String],
) -> BTreeMap<String, String> {
    let mut hashes = BTreeMap::new();
    for path in paths {
        if contract.classify(path) != ArtifactClass::Canonical {
            continue;
        }
        let Ok(bytes) = fs::read(repo_root.join(path)) else {
            continue;
        };
        hashes.insert(path.clone(), sha256_hex(&bytes));
    }
    hashes
}

/// Markdown table of at most `cap` entries in `entry_hash` order.
pub fn render_snapshot_markdown(entries: &[LedgerEntry], cap: usize) -> String {
    let mut sorted: Vec<&LedgerEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.entry_hash.cmp(&b.entry_hash));
    let shown = sorted.len().min(cap);

    let mut out = String::from("# XStack Execution Ledger\n\n");
    out.push_str(&format!(
        "Showing {shown} of {} entries (ordered by entry hash).\n\n",
        sorted.len()
    ));
    out.push_str("| entry | profile | plan | repo state | runners | hits | misses | failure | duration_s |\n");
    out.push_str("|---|---|---|---|---|---|---|---|---|\n");
    for entry in sorted.into_iter().take(cap) {
        let failure = if entry.failure_class.is_empty() {
            "-"
        } else {
            entry.failure_class.as_str()
        };
        out.push_str(&format!(
            "| `{}` | {} | `{}` | `{}` | {} | {} | {} | {} | {:.3} |\n",
            short(&entry.entry_hash),
            entry.profile,
            short(&entry.plan_hash),
            short(&entry.repo_state_hash),
            entry.runner_ids_executed.len(),
            entry.cache_hits,
            entry.cache_misses,
            failure,
            entry.duration_s,
        ));
    }
    out
}

fn short(hash: &str) -> &str {
    hash.get(..SHORT_HASH_LEN).unwrap_or(hash)
}

/// Write the snapshot markdown to `path`.
pub fn export_snapshot_markdown(entries: &[LedgerEntry], cap: usize, path: &Path) -> Result<()> {
    let body = render_snapshot_markdown(entries, cap);
    write_atomic(path, &body)
        .with_context(|| format!("export ledger snapshot {}", path.display()))
}
