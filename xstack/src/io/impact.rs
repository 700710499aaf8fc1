//! Changed-path discovery and impact graph construction.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::impact::{ImpactAnalysis, derive_impact, filter_changed_paths};
use crate::core::paths::relative_to;
use crate::io::artifact_contract::ArtifactContract;
use crate::io::config::RegistryPaths;
use crate::io::git::Git;
use crate::io::registries::{Registries, load_registries};

/// Raw changed paths: `diff <base>...HEAD`, else `status --porcelain`.
///
/// Git failures degrade to an empty change set (the quiet-workspace case).
pub fn discover_changed_paths(repo_root: &Path, baseline_ref: &str) -> Vec<String> {
    let git = Git::new(repo_root);
    match git.diff_name_only(baseline_ref) {
        Ok(paths) if !paths.is_empty() => return paths,
        Ok(_) => debug!(baseline_ref, "diff empty; falling back to status"),
        Err(err) => debug!(
            baseline_ref,
            err = %format!("{err:#}"),
            "diff failed; falling back to status"
        ),
    }
    match git.status_porcelain() {
        Ok(entries) => entries.into_iter().map(|entry| entry.path).collect(),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "git status failed; assuming no changes");
            Vec::new()
        }
    }
}

/// Impact analysis against already-loaded registries and contract.
///
/// A `cache_root` inside the repository never counts as a change.
#[instrument(skip_all, fields(baseline_ref))]
pub fn analyze_impact(
    repo_root: &Path,
    cache_root: &Path,
    registries: &Registries,
    contract: &ArtifactContract,
    baseline_ref: &str,
) -> Result<ImpactAnalysis> {
    let raw = discover_changed_paths(repo_root, baseline_ref);
    let cache_prefix: Vec<String> = relative_to(repo_root, cache_root)
        .filter(|rel| !rel.is_empty())
        .into_iter()
        .collect();
    let changed = filter_changed_paths(&raw, &contract.skip_set(), &cache_prefix);
    debug!(raw = raw.len(), kept = changed.len(), "changed paths filtered");
    let analysis = derive_impact(
        &changed,
        &registries.testx_groups,
        &registries.auditx_groups,
        &registries.components,
    )?;
    Ok(analysis)
}

/// Load the registries and contract named by `paths`, then analyze impact.
pub fn build_impact_graph(
    repo_root: &Path,
    cache_root: &Path,
    paths: &RegistryPaths,
    baseline_ref: &str,
) -> Result<ImpactAnalysis> {
    let registries = load_registries(repo_root, paths)?;
    let contract = ArtifactContract::load(repo_root, &paths.derived_artifacts);
    analyze_impact(repo_root, cache_root, &registries, &contract, baseline_ref)
}
