//! Execution-plan construction.
//!
//! Resolves the profile, hashes the working tree, derives impact, generates
//! nodes, orders them, and fingerprints the result. The plan is persisted to
//! `<cache_root>/plans/<plan_hash>.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::canonical::{canonical_hash, to_sorted_value};
use crate::core::extensions::{
    AUDITX_RUNNER, HEAVYWEIGHT_RUNNERS, REPOX_RUNNER, TESTX_RUNNER, extension_for_runner,
    extension_registry, tool_version_for,
};
use crate::core::graph::{
    apply_artifact_write_order, assign_levels, estimate, filter_only_gates, sort_canonical,
    validate_nodes,
};
use crate::core::profile::{
    admits, include_all_groups, pinned_strict_variant, select_profile, strict_variant,
};
use crate::core::refusal::Refusal;
use crate::core::types::{ExecutionPlan, GroupSpec, ImpactGraph, PlanNode, Profile};
use crate::io::artifact_contract::ArtifactContract;
use crate::io::config::XStackConfig;
use crate::io::env::{Env, env_value};
use crate::io::fs_util::{read_json, write_canonical_json};
use crate::io::impact::analyze_impact;
use crate::io::merkle::{HashScope, compute_repo_state_hash};
use crate::io::registries::{Registries, load_registries};

pub const PLAN_SCHEMA_VERSION: &str = "1.0.0";

/// The policy scan every plan starts with.
pub const BASE_NODE_ID: &str = "repox.base";

/// Inputs for [`build_execution_plan`].
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub repo_root: &'a Path,
    pub gate_command: &'a str,
    /// Empty means "resolve from policy and gate command".
    pub requested_profile: &'a str,
    pub workspace_id: &'a str,
    pub cache_root: &'a Path,
    pub only_gates: &'a [String],
    pub config: &'a XStackConfig,
    pub env: &'a Env,
}

/// Build, validate, fingerprint, and persist the plan.
#[instrument(skip_all, fields(gate_command = request.gate_command))]
pub fn build_execution_plan(request: &PlanRequest<'_>) -> Result<ExecutionPlan> {
    let config = request.config;
    let registries = load_registries(request.repo_root, &config.registries)?;
    let profile = select_profile(
        request.requested_profile,
        request.gate_command,
        &registries.default_mode_by_command,
    )?;
    let pinned_variant = pinned_strict_variant(
        request.requested_profile,
        request.gate_command,
        &registries.default_mode_by_command,
    );

    let contract = ArtifactContract::load(request.repo_root, &config.registries.derived_artifacts);
    let analysis = analyze_impact(
        request.repo_root,
        request.cache_root,
        &registries,
        &contract,
        &config.baseline_ref(request.env),
    )?;

    let scope = HashScope {
        contract_path: config.registries.derived_artifacts.clone(),
        ..HashScope::default()
    };
    let state = compute_repo_state_hash(request.repo_root, request.cache_root, &scope)
        .context("compute repo state hash")?;

    let include_all = include_all_groups(profile, env_value(request.env, "DOM_GATE_FULL_ALL"));
    let (nodes, mut explain) =
        generate_nodes(profile, &analysis.graph, &analysis.reasons, &registries, include_all);
    let nodes = order_nodes(nodes, request.only_gates)?;
    explain.retain(|node_id, _| nodes.iter().any(|node| &node.node_id == node_id));
    if !request.only_gates.is_empty() {
        for reason in explain.values_mut() {
            reason.push_str("; selected by --only-gate");
        }
    }
    check_tool_versions(&nodes, &config.tool_versions)?;

    let estimate = estimate(&nodes, profile, config.warn_full_plan_work_units);
    let mut plan = ExecutionPlan {
        schema_version: PLAN_SCHEMA_VERSION.to_string(),
        gate_command: request.gate_command.to_string(),
        profile,
        strict_variant: strict_variant(profile, pinned_variant, &analysis.graph.changed_paths),
        workspace_id: request.workspace_id.to_string(),
        repo_state_hash: state.repo_state_hash,
        merkle_roots: state.roots,
        impact: analysis.graph,
        nodes,
        estimate,
        explain,
        plan_hash: String::new(),
    };
    validate_plan(&plan)?;
    plan.plan_hash = plan_hash(&plan)?;

    let path = plan_path(request.cache_root, &plan.plan_hash);
    write_canonical_json(&path, &plan)?;
    info!(
        plan_hash = %plan.plan_hash,
        profile = plan.profile.as_str(),
        nodes = plan.nodes.len(),
        "plan built"
    );
    Ok(plan)
}

/// Base node, impacted (or all) admitted groups, and FULL heavyweights.
///
/// Returns the nodes with empty levels plus why each was included.
pub fn generate_nodes(
    profile: Profile,
    impact: &ImpactGraph,
    reasons: &BTreeMap<String, String>,
    registries: &Registries,
    include_all: bool,
) -> (Vec<PlanNode>, BTreeMap<String, String>) {
    let mut nodes = Vec::new();
    let mut explain = BTreeMap::new();

    if let Some(ext) = extension_registry().get(REPOX_RUNNER) {
        nodes.push(PlanNode {
            node_id: BASE_NODE_ID.to_string(),
            runner_id: REPOX_RUNNER.to_string(),
            group_id: String::new(),
            command: ext.command_template(),
            expected_artifacts: ext.artifacts(),
            parallelizable: false,
            depends_on: Default::default(),
            level: 0,
        });
        explain.insert(BASE_NODE_ID.to_string(), "base policy scan".to_string());
    }

    let families = [
        (TESTX_RUNNER, &registries.testx_groups, &impact.impacted_testx_groups),
        (AUDITX_RUNNER, &registries.auditx_groups, &impact.impacted_auditx_groups),
    ];
    for (family_runner, groups, impacted) in families {
        let mut known: Vec<GroupSpec> = groups.clone();
        for group_id in impacted {
            if !known.iter().any(|group| &group.group_id == group_id) {
                known.push(GroupSpec {
                    group_id: group_id.clone(),
                    patterns: Vec::new(),
                    default_profile: "FAST".to_string(),
                    command: None,
                    parallelizable: None,
                });
            }
        }
        known.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        for group in known {
            let is_impacted = impacted.contains(&group.group_id);
            if !(is_impacted || include_all) || !admits(profile, &group.default_profile) {
                continue;
            }
            let reason = if is_impacted {
                reasons
                    .get(&group.group_id)
                    .cloned()
                    .unwrap_or_else(|| "impacted group".to_string())
            } else {
                "include-all".to_string()
            };
            explain.insert(group.group_id.clone(), reason);
            nodes.push(group_node(family_runner, &group));
        }
    }

    if profile.is_full_family() {
        for runner_id in HEAVYWEIGHT_RUNNERS {
            let Some(ext) = extension_registry().get(runner_id) else {
                continue;
            };
            let node_id = format!("{}.full", ext.extension_id);
            explain.insert(node_id.clone(), "heavyweight runner for FULL".to_string());
            nodes.push(PlanNode {
                node_id,
                runner_id: runner_id.to_string(),
                group_id: String::new(),
                command: ext.command_template(),
                expected_artifacts: ext.artifacts(),
                parallelizable: true,
                depends_on: [BASE_NODE_ID.to_string()].into_iter().collect(),
                level: 0,
            });
        }
    }
    (nodes, explain)
}

fn group_node(family_runner: &str, group: &GroupSpec) -> PlanNode {
    let family_prefix = family_runner.trim_end_matches("_runner");
    let runner_id = if group.group_id.starts_with(&format!("{family_prefix}.")) {
        group.group_id.clone()
    } else {
        family_runner.to_string()
    };
    let ext = extension_for_runner(family_runner);
    let command = match &group.command {
        Some(command) if !command.is_empty() => command.clone(),
        _ => {
            let mut command = ext.map(|ext| ext.command_template()).unwrap_or_default();
            command.push("--group".to_string());
            command.push(group.group_id.clone());
            command
        }
    };
    let expected_artifacts = ext
        .map(|ext| group_artifacts(&ext.artifacts(), &group.group_id))
        .unwrap_or_default();
    PlanNode {
        node_id: group.group_id.clone(),
        runner_id,
        group_id: group.group_id.clone(),
        command,
        expected_artifacts,
        parallelizable: group.parallelizable.unwrap_or(true),
        depends_on: [BASE_NODE_ID.to_string()].into_iter().collect(),
        level: 0,
    }
}

/// Family artifacts namespaced under a per-group directory.
fn group_artifacts(family: &[String], group_id: &str) -> Vec<String> {
    let mut artifacts: Vec<String> = family
        .iter()
        .map(|path| match path.rsplit_once('/') {
            Some((dir, file)) => format!("{dir}/{group_id}/{file}"),
            None => format!("{group_id}/{path}"),
        })
        .collect();
    artifacts.sort();
    artifacts
}

/// Only-gate filter, write-order edges, levels, canonical sort.
pub fn order_nodes(nodes: Vec<PlanNode>, only_gates: &[String]) -> Result<Vec<PlanNode>, Refusal> {
    let mut nodes = filter_only_gates(nodes, only_gates);
    apply_artifact_write_order(&mut nodes);
    assign_levels(&mut nodes)?;
    sort_canonical(&mut nodes);
    debug!(nodes = nodes.len(), "nodes ordered");
    Ok(nodes)
}

fn check_tool_versions(
    nodes: &[PlanNode],
    overrides: &BTreeMap<String, String>,
) -> Result<(), Refusal> {
    for node in nodes {
        if tool_version_for(&node.runner_id, overrides).is_none() {
            return Err(Refusal::PlanInputsMalformed(format!(
                "runner '{}' has no tool version",
                node.runner_id
            )));
        }
    }
    Ok(())
}

/// Structural checks on a finished plan: acyclic, closed, write-ordered.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<(), Refusal> {
    validate_nodes(&plan.nodes)
}

/// `sha256(canonical-json(plan))` without `plan_hash`, `workspace_id`, and `explain`.
pub fn plan_hash(plan: &ExecutionPlan) -> Result<String> {
    let mut value = to_sorted_value(plan)?;
    if let Some(object) = value.as_object_mut() {
        for key in ["plan_hash", "workspace_id", "explain"] {
            object.remove(key);
        }
    }
    canonical_hash(&value)
}

pub fn plan_path(cache_root: &Path, plan_hash: &str) -> PathBuf {
    cache_root.join("plans").join(format!("{plan_hash}.json"))
}

/// Read a persisted plan back and verify its fingerprint.
pub fn load_plan(cache_root: &Path, plan_hash_hex: &str) -> Result<ExecutionPlan> {
    let plan: ExecutionPlan = read_json(&plan_path(cache_root, plan_hash_hex))?;
    let recomputed = plan_hash(&plan)?;
    if recomputed != plan.plan_hash {
        return Err(Refusal::PlanInputsMalformed(format!(
            "plan {plan_hash_hex} fingerprint mismatch (recomputed {recomputed})"
        ))
        .into());
    }
    Ok(plan)
}
