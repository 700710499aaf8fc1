//! Subtree Merkle hashing of the working tree.
//!
//! Each enumerated subtree hashes to `sha256` of its sorted
//! `<rel_path>:<file_sha256>` lines; the repo-state hash covers every
//! enumerated subtree, including missing ones. Per-file digests are reused
//! from `<cache_root>/merkle/file_hashes.json` while size and mtime match.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::canonical::{empty_sha256, sha256_hex, sorted_lines_hash};
use crate::core::paths::{
    has_fixed_skip_component, is_tool_cache_path, is_under, normalize_rel, relative_to,
};
use crate::core::types::{ArtifactClass, SubtreeRoot};
use crate::io::artifact_contract::{
    ArtifactContract, DEFAULT_CONTRACT_PATH, FALLBACK_EXCLUDED_PREFIXES,
};
use crate::io::fs_util::{read_json, write_canonical_json};

/// Subtrees hashed when the caller does not name any.
pub const DEFAULT_SUBTREES: &[&str] = &[
    "app", "client", "data", "docs", "engine", "game", "libs", "schema", "scripts", "server",
    "tests", "tools",
];

const MERKLE_DIR: &str = "merkle";
const ROOTS_FILE: &str = "roots.json";
const FILE_HASHES_FILE: &str = "file_hashes.json";

/// What to hash and which artifact classes to leave out.
///
/// An empty `include_classes` admits every class not excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashScope {
    pub subtrees: Vec<String>,
    pub include_classes: BTreeSet<ArtifactClass>,
    pub exclude_classes: BTreeSet<ArtifactClass>,
    pub extra_excluded_prefixes: Vec<String>,
    pub contract_path: String,
}

impl Default for HashScope {
    fn default() -> Self {
        Self {
            subtrees: DEFAULT_SUBTREES.iter().map(|s| s.to_string()).collect(),
            include_classes: BTreeSet::new(),
            exclude_classes: BTreeSet::from([ArtifactClass::RunMeta, ArtifactClass::DerivedView]),
            extra_excluded_prefixes: Vec::new(),
            contract_path: DEFAULT_CONTRACT_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    pub repo_state_hash: String,
    pub roots: BTreeMap<String, SubtreeRoot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileHashRow {
    size: u64,
    mtime_ns: u64,
    hash: String,
}

type FileHashCache = BTreeMap<String, FileHashRow>;

struct PathFilter<'a> {
    contract: &'a ArtifactContract,
    scope: &'a HashScope,
    excluded_prefixes: Vec<String>,
}

impl PathFilter<'_> {
    fn skips_dir(&self, rel: &str) -> bool {
        has_fixed_skip_component(rel)
            || is_tool_cache_path(&format!("{rel}/"))
            || self.excluded_prefixes.iter().any(|p| is_under(rel, p))
    }

    fn admits_file(&self, rel: &str) -> bool {
        if has_fixed_skip_component(rel)
            || is_tool_cache_path(rel)
            || self.excluded_prefixes.iter().any(|p| is_under(rel, p))
        {
            return false;
        }
        if !self.contract.available {
            return true;
        }
        let class = self.contract.classify(rel);
        if self.scope.exclude_classes.contains(&class) {
            return false;
        }
        self.scope.include_classes.is_empty() || self.scope.include_classes.contains(&class)
    }
}

/// Hash the working tree and persist roots plus the file-hash cache.
#[instrument(skip_all, fields(repo_root = %repo_root.display()))]
pub fn compute_repo_state_hash(
    repo_root: &Path,
    cache_root: &Path,
    scope: &HashScope,
) -> Result<RepoState> {
    let contract = ArtifactContract::load(repo_root, &scope.contract_path);
    let mut excluded_prefixes: Vec<String> = scope
        .extra_excluded_prefixes
        .iter()
        .map(|p| normalize_rel(p))
        .filter(|p| !p.is_empty())
        .collect();
    if !contract.available {
        excluded_prefixes.extend(FALLBACK_EXCLUDED_PREFIXES.iter().map(|p| normalize_rel(p)));
    }
    if let Some(rel) = relative_to(repo_root, cache_root)
        && !rel.is_empty()
    {
        excluded_prefixes.push(rel);
    }
    let filter = PathFilter {
        contract: &contract,
        scope,
        excluded_prefixes,
    };

    let cache_path = cache_root.join(MERKLE_DIR).join(FILE_HASHES_FILE);
    let previous = load_file_hashes(&cache_path);
    let mut current = FileHashCache::new();

    let subtrees: BTreeSet<String> = scope
        .subtrees
        .iter()
        .map(|s| normalize_rel(s))
        .filter(|s| !s.is_empty())
        .collect();

    let mut roots = BTreeMap::new();
    for subtree in &subtrees {
        let root = hash_subtree(repo_root, subtree, &filter, &previous, &mut current)?;
        roots.insert(subtree.clone(), root);
    }
    let repo_state_hash = sorted_lines_hash(
        roots
            .iter()
            .map(|(name, root)| format!("{name}:{}", root.hash))
            .collect(),
    );
    let state = RepoState {
        repo_state_hash,
        roots,
    };

    let reused = current
        .iter()
        .filter(|(rel, row)| previous.get(*rel) == Some(row))
        .count();
    debug!(files = current.len(), reused, hash = %state.repo_state_hash, "repo state hashed");

    write_canonical_json(&cache_path, &current)?;
    write_canonical_json(&cache_root.join(MERKLE_DIR).join(ROOTS_FILE), &state)?;
    Ok(state)
}

fn hash_subtree(
    repo_root: &Path,
    subtree: &str,
    filter: &PathFilter<'_>,
    previous: &FileHashCache,
    current: &mut FileHashCache,
) -> Result<SubtreeRoot> {
    let dir = repo_root.join(subtree);
    if !dir.is_dir() || filter.skips_dir(subtree) {
        return Ok(SubtreeRoot {
            exists: dir.is_dir(),
            hash: empty_sha256(),
            file_count: 0,
        });
    }

    let mut lines = Vec::new();
    let walker = WalkDir::new(&dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| keep_entry(repo_root, entry, filter));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_to(repo_root, entry.path()) else {
            continue;
        };
        if !filter.admits_file(&rel) {
            continue;
        }
        let digest = file_digest(entry.path(), &rel, previous, current)?;
        lines.push(format!("{rel}:{digest}"));
    }
    let file_count = lines.len() as u64;
    Ok(SubtreeRoot {
        exists: true,
        hash: sorted_lines_hash(lines),
        file_count,
    })
}

fn keep_entry(repo_root: &Path, entry: &DirEntry, filter: &PathFilter<'_>) -> bool {
    if !entry.file_type().is_dir() {
        return true;
    }
    match relative_to(repo_root, entry.path()) {
        Some(rel) => !filter.skips_dir(&rel),
        None => true,
    }
}

fn file_digest(
    path: &Path,
    rel: &str,
    previous: &FileHashCache,
    current: &mut FileHashCache,
) -> Result<String> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let size = meta.len();
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    if let Some(row) = previous.get(rel)
        && row.size == size
        && row.mtime_ns == mtime_ns
        && !row.hash.is_empty()
    {
        current.insert(rel.to_string(), row.clone());
        return Ok(row.hash.clone());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let hash = sha256_hex(&bytes);
    current.insert(
        rel.to_string(),
        FileHashRow {
            size,
            mtime_ns,
            hash: hash.clone(),
        },
    );
    Ok(hash)
}

fn load_file_hashes(path: &Path) -> FileHashCache {
    if !path.exists() {
        return FileHashCache::new();
    }
    match read_json(path) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(path = %path.display(), err = %format!("{err:#}"), "discarding file hash cache");
            FileHashCache::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const CONTRACT: &str = r#"{"record":{"artifacts":[
        {"artifact_id":"canon","path":"docs/canonical.md","artifact_class":"CANONICAL"},
        {"artifact_id":"meta","path":"docs/audit/run_meta.json","artifact_class":"RUN_META"},
        {"artifact_id":"view","path":"docs/audit/view.md","artifact_class":"DERIVED_VIEW"}
    ]}}"#;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write");
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        write(&root, DEFAULT_CONTRACT_PATH, CONTRACT);
        write(&root, "docs/canonical.md", "canonical v1\n");
        write(&root, "docs/audit/run_meta.json", "{\"run\":1}\n");
        write(&root, "docs/audit/view.md", "view v1\n");
        write(&root, "engine/core.c", "int main(void) { return 0; }\n");
        (temp, root)
    }

    fn canonical_only() -> HashScope {
        HashScope {
            include_classes: BTreeSet::from([ArtifactClass::Canonical]),
            ..HashScope::default()
        }
    }

    #[test]
    fn run_meta_edits_are_invisible_and_canonical_edits_are_not() {
        let (_temp, root) = fixture();
        let cache = root.join(".xstack_cache");
        let scope = canonical_only();
        let first = compute_repo_state_hash(&root, &cache, &scope).expect("hash");

        write(&root, "docs/audit/run_meta.json", "{\"run\":2}\n");
        write(&root, "docs/audit/view.md", "view v2\n");
        let second = compute_repo_state_hash(&root, &cache, &scope).expect("hash");
        assert_eq!(first.repo_state_hash, second.repo_state_hash);

        write(&root, "docs/canonical.md", "canonical v2 changed\n");
        let third = compute_repo_state_hash(&root, &cache, &scope).expect("hash");
        assert_ne!(second.repo_state_hash, third.repo_state_hash);
    }

    #[test]
    fn missing_subtrees_hash_to_empty_input() {
        let (_temp, root) = fixture();
        let state =
            compute_repo_state_hash(&root, &root.join(".xstack_cache"), &HashScope::default())
                .expect("hash");
        let game = &state.roots["game"];
        assert!(!game.exists);
        assert_eq!(game.hash, empty_sha256());
        assert_eq!(game.file_count, 0);
        assert_eq!(state.roots["engine"].file_count, 1);
        assert_eq!(state.roots.len(), DEFAULT_SUBTREES.len());
    }

    #[test]
    fn hash_is_stable_and_persists_caches() {
        let (_temp, root) = fixture();
        let cache = root.join(".xstack_cache");
        let first = compute_repo_state_hash(&root, &cache, &HashScope::default()).expect("hash");
        let second = compute_repo_state_hash(&root, &cache, &HashScope::default()).expect("hash");
        assert_eq!(first, second);
        let roots: RepoState = read_json(&cache.join("merkle/roots.json")).expect("roots");
        assert_eq!(roots, first);
        let rows: FileHashCache = read_json(&cache.join("merkle/file_hashes.json")).expect("rows");
        assert!(rows.contains_key("engine/core.c"));
        assert!(!rows.contains_key("docs/audit/run_meta.json"));
    }

    #[test]
    fn skips_vcs_caches_and_tool_caches() {
        let (_temp, root) = fixture();
        let cache = root.join(".xstack_cache");
        let before = compute_repo_state_hash(&root, &cache, &HashScope::default()).expect("hash");
        write(&root, "tools/lint/cache/blob.bin", "cached");
        write(&root, "engine/__pycache__/mod.pyc", "bytecode");
        let after = compute_repo_state_hash(&root, &cache, &HashScope::default()).expect("hash");
        assert_eq!(before.repo_state_hash, after.repo_state_hash);
    }

    #[test]
    fn missing_contract_falls_back_to_prefix_exclusions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "docs/readme.md", "readme\n");
        write(root, "docs/audit/findings.json", "{}\n");
        let cache = root.join(".xstack_cache");
        let before = compute_repo_state_hash(root, &cache, &HashScope::default()).expect("hash");
        write(root, "docs/audit/findings.json", "{\"changed\":true}\n");
        let after = compute_repo_state_hash(root, &cache, &HashScope::default()).expect("hash");
        assert_eq!(before.repo_state_hash, after.repo_state_hash);
        assert_eq!(after.roots["docs"].file_count, 1);
    }

    #[test]
    fn extra_prefixes_are_excluded() {
        let (_temp, root) = fixture();
        let cache = root.join(".xstack_cache");
        let scope = HashScope {
            extra_excluded_prefixes: vec!["engine/".to_string()],
            ..HashScope::default()
        };
        let state = compute_repo_state_hash(&root, &cache, &scope).expect("hash");
        assert_eq!(state.roots["engine"].hash, empty_sha256());
    }
}
