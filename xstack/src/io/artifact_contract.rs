//! Derived-artifact registry: classifies repository paths.
//!
//! When the registry is missing or malformed every path classifies as
//! UNKNOWN and the hasher falls back to [`FALLBACK_EXCLUDED_PREFIXES`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::paths::{is_under, normalize_rel};
use crate::core::types::ArtifactClass;

/// Default registry location relative to the repo root.
pub const DEFAULT_CONTRACT_PATH: &str = "data/registries/derived_artifacts.json";

/// Prefixes excluded from hashing when no contract is available.
pub const FALLBACK_EXCLUDED_PREFIXES: &[&str] = &[
    "docs/audit/",
    ".xstack_cache/",
    "build/",
    "dist/",
    "tmp/",
    "out/",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub path: String,
    pub artifact_class: ArtifactClass,
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    record: RawRecord,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    artifacts: Vec<RawArtifact>,
}

#[derive(Debug, Deserialize)]
struct RawArtifact {
    #[serde(default)]
    artifact_id: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    artifact_class: String,
}

/// Loaded contract. `available` is false when the file was missing or malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactContract {
    pub records: BTreeMap<String, ArtifactRecord>,
    pub available: bool,
}

impl ArtifactContract {
    /// Load the registry at `repo_root/rel_path`; never fails.
    pub fn load(repo_root: &Path, rel_path: &str) -> Self {
        let path = repo_root.join(rel_path);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(path = %path.display(), err = %err, "artifact contract unavailable");
                return Self::default();
            }
        };
        let raw: RawRegistry = match serde_json::from_str(&contents) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "artifact contract malformed");
                return Self::default();
            }
        };
        let mut records = BTreeMap::new();
        for artifact in raw.record.artifacts {
            let rel = normalize_rel(&artifact.path);
            if rel.is_empty() {
                continue;
            }
            let artifact_id = if artifact.artifact_id.trim().is_empty() {
                rel.clone()
            } else {
                artifact.artifact_id.trim().to_string()
            };
            records.insert(
                artifact_id.clone(),
                ArtifactRecord {
                    artifact_id,
                    path: rel,
                    artifact_class: ArtifactClass::parse_lenient(&artifact.artifact_class),
                },
            );
        }
        debug!(count = records.len(), "artifact contract loaded");
        Self {
            records,
            available: true,
        }
    }

    /// Class of `path`: the longest registry path equal to or containing it.
    pub fn classify(&self, path: &str) -> ArtifactClass {
        let path = normalize_rel(path);
        self.records
            .values()
            .filter(|record| is_under(&path, &record.path))
            .max_by(|a, b| {
                a.path
                    .len()
                    .cmp(&b.path.len())
                    .then_with(|| b.artifact_id.cmp(&a.artifact_id))
            })
            .map(|record| record.artifact_class)
            .unwrap_or(ArtifactClass::Unknown)
    }

    /// Registry paths whose class is in `classes`.
    pub fn paths_in_classes(&self, classes: &BTreeSet<ArtifactClass>) -> BTreeSet<String> {
        self.records
            .values()
            .filter(|record| classes.contains(&record.artifact_class))
            .map(|record| record.path.clone())
            .collect()
    }

    /// Paths the hasher and impact graph skip: RUN_META and DERIVED_VIEW records.
    pub fn skip_set(&self) -> BTreeSet<String> {
        self.paths_in_classes(&BTreeSet::from([
            ArtifactClass::RunMeta,
            ArtifactClass::DerivedView,
        ]))
    }
}

/// `artifact_id → record` from the default registry location.
pub fn load_artifact_contract(repo_root: &Path) -> BTreeMap<String, ArtifactRecord> {
    ArtifactContract::load(repo_root, DEFAULT_CONTRACT_PATH).records
}

/// Bucket `paths` by class; each bucket sorted and de-duplicated, all four present.
pub fn classify_paths(
    repo_root: &Path,
    paths: &[String],
) -> BTreeMap<ArtifactClass, Vec<String>> {
    let contract = ArtifactContract::load(repo_root, DEFAULT_CONTRACT_PATH);
    classify_with(&contract, paths)
}

pub fn classify_with(
    contract: &ArtifactContract,
    paths: &[String],
) -> BTreeMap<ArtifactClass, Vec<String>> {
    let mut buckets: BTreeMap<ArtifactClass, BTreeSet<String>> = ArtifactClass::ALL
        .iter()
        .map(|class| (*class, BTreeSet::new()))
        .collect();
    for path in paths {
        let rel = normalize_rel(path);
        if rel.is_empty() {
            continue;
        }
        buckets
            .entry(contract.classify(&rel))
            .or_default()
            .insert(rel);
    }
    buckets
        .into_iter()
        .map(|(class, set)| (class, set.into_iter().collect()))
        .collect()
}
