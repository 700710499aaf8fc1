//! Shared deterministic types for the orchestrator core.
//!
//! These types define the stable records that are hashed, persisted, and
//! printed. Every list they carry is kept sorted so serialized output is
//! independent of discovery order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::refusal::Refusal;

/// Classification of a repository path by the derived-artifact registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactClass {
    /// Semantically load-bearing; participates in the repo-state-hash.
    Canonical,
    /// Regenerated view of canonical data.
    DerivedView,
    /// Timestamps, durations, per-run scratch.
    RunMeta,
    /// Not declared by the registry.
    Unknown,
}

impl ArtifactClass {
    pub const ALL: [ArtifactClass; 4] = [
        ArtifactClass::Canonical,
        ArtifactClass::DerivedView,
        ArtifactClass::RunMeta,
        ArtifactClass::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canonical => "CANONICAL",
            Self::DerivedView => "DERIVED_VIEW",
            Self::RunMeta => "RUN_META",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a registry class token; anything unrecognized is `Unknown`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CANONICAL" => Self::Canonical,
            "DERIVED_VIEW" => Self::DerivedView,
            "RUN_META" => Self::RunMeta,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Profile {
    Fast,
    Strict,
    Full,
    FullAll,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "FAST",
            Self::Strict => "STRICT",
            Self::Full => "FULL",
            Self::FullAll => "FULL_ALL",
        }
    }

    /// Parse a profile token, normalizing case and `-` separators.
    pub fn parse(raw: &str) -> Result<Self, Refusal> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FAST" => Ok(Self::Fast),
            "STRICT" | "STRICT_LIGHT" | "STRICT_DEEP" => Ok(Self::Strict),
            "FULL" => Ok(Self::Full),
            "FULL_ALL" => Ok(Self::FullAll),
            other => Err(Refusal::PlanInputsMalformed(format!(
                "unknown profile '{other}'"
            ))),
        }
    }

    /// FAST and STRICT stop dispatching on the first failure.
    pub fn is_fail_fast(self) -> bool {
        matches!(self, Self::Fast | Self::Strict)
    }

    pub fn is_full_family(self) -> bool {
        matches!(self, Self::Full | Self::FullAll)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// STRICT refinement chosen from the change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrictVariant {
    StrictLight,
    StrictDeep,
}

impl StrictVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrictLight => "STRICT_LIGHT",
            Self::StrictDeep => "STRICT_DEEP",
        }
    }

    /// `STRICT-LIGHT`/`STRICT_DEEP` style names, case-insensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "STRICT_LIGHT" => Some(Self::StrictLight),
            "STRICT_DEEP" => Some(Self::StrictDeep),
            _ => None,
        }
    }
}

/// Hash record for one enumerated subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeRoot {
    pub exists: bool,
    pub hash: String,
    pub file_count: u64,
}

/// Changed files mapped onto groups, subsystems, and runners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactGraph {
    pub changed_paths: Vec<String>,
    pub impacted_subsystems: Vec<String>,
    pub impacted_testx_groups: Vec<String>,
    pub impacted_auditx_groups: Vec<String>,
    pub required_runners: Vec<String>,
}

/// A TestX or AuditX group record from the group registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub group_id: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_group_profile")]
    pub default_profile: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub parallelizable: Option<bool>,
}

fn default_group_profile() -> String {
    "FAST".to_string()
}

/// A component record mapping subsystems onto the runners they require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub component_id: String,
    #[serde(default)]
    pub subsystems: Vec<String>,
    #[serde(default)]
    pub runners: Vec<String>,
}

/// One runner invocation in an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique within the plan.
    pub node_id: String,
    /// Adapter key.
    pub runner_id: String,
    /// Empty for non-grouped runners.
    pub group_id: String,
    /// Ordered argv template; may use `{repo_root}` and `{profile}`.
    pub command: Vec<String>,
    /// Declared produced paths, sorted.
    pub expected_artifacts: Vec<String>,
    pub parallelizable: bool,
    pub depends_on: BTreeSet<String>,
    /// Topological rank, filled by the planner.
    pub level: u32,
}

/// Structural work estimate. Never a wall-clock prediction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEstimate {
    pub node_count: u64,
    pub work_units: u64,
    pub parallel_bucket_max: u64,
    pub warn_full_plan_too_large: bool,
}

/// A deterministic, fingerprinted DAG of runner nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub schema_version: String,
    pub gate_command: String,
    pub profile: Profile,
    pub strict_variant: Option<StrictVariant>,
    /// Cosmetic at plan time; excluded from `plan_hash`.
    pub workspace_id: String,
    pub repo_state_hash: String,
    pub merkle_roots: BTreeMap<String, SubtreeRoot>,
    pub impact: ImpactGraph,
    /// Canonically ordered.
    pub nodes: Vec<PlanNode>,
    pub estimate: PlanEstimate,
    /// Why each node was included; excluded from `plan_hash`.
    pub explain: BTreeMap<String, String>,
    pub plan_hash: String,
}

impl ExecutionPlan {
    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|node| node.node_id == node_id)
    }
}

/// Normalized outcome of one runner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerResult {
    pub runner_id: String,
    pub exit_code: i32,
    pub output: String,
    /// Sorted.
    pub artifacts_produced: Vec<String>,
    pub output_hash: String,
    pub timestamp_utc: String,
    /// Set when the process never ran (setup or spawn failure, runner panic).
    /// Such results are reported but never cached.
    #[serde(skip)]
    pub never_ran: bool,
}

/// Persisted per-runner cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub runner_id: String,
    pub input_hash: String,
    pub profile_id: String,
    pub tool_version: String,
    pub output_hash: String,
    pub exit_code: i32,
    pub output: String,
    /// Sorted.
    pub artifacts_produced: Vec<String>,
    pub timestamp_utc: String,
}

/// Content-addressed record of one gate invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub schema_version: String,
    pub repo_state_hash: String,
    pub plan_hash: String,
    pub profile: String,
    /// Sorted.
    pub runner_ids_executed: Vec<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub artifact_hashes: BTreeMap<String, String>,
    pub failure_class: String,
    pub duration_s: f64,
    pub workspace_id: String,
    pub entry_hash: String,
}
