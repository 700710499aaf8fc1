//! Process-wide registry of runner adapters.
//!
//! Each extension declares its runner id, family, canonical artifact set,
//! scope subtrees, cost class, tool version, and default argv template. The
//! map is built once and never mutated.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::Serialize;

/// Runner families share output-routing flags and artifact contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerFamily {
    Policy,
    Tests,
    Audit,
    Performance,
    Compatibility,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Low,
    Medium,
    High,
}

impl CostClass {
    pub fn work_units(self) -> u64 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Extension {
    pub extension_id: &'static str,
    pub runner_id: &'static str,
    pub family: RunnerFamily,
    /// Canonical artifacts the runner produces, sorted.
    pub artifact_contract: &'static [&'static str],
    pub scope_subtrees: &'static [&'static str],
    pub cost_class: CostClass,
    pub tool_version: &'static str,
    pub command: &'static [&'static str],
}

impl Extension {
    pub fn artifacts(&self) -> Vec<String> {
        let mut artifacts: Vec<String> = self
            .artifact_contract
            .iter()
            .map(|path| path.to_string())
            .collect();
        artifacts.sort();
        artifacts
    }

    pub fn command_template(&self) -> Vec<String> {
        self.command.iter().map(|token| token.to_string()).collect()
    }
}

pub const REPOX_RUNNER: &str = "repox_runner";
pub const TESTX_RUNNER: &str = "testx_runner";
pub const AUDITX_RUNNER: &str = "auditx_runner";
pub const PERFORMX_RUNNER: &str = "performx_runner";
pub const COMPATX_RUNNER: &str = "compatx_runner";
pub const SECUREX_RUNNER: &str = "securex_runner";

/// Runners appended to every FULL plan regardless of impact.
pub const HEAVYWEIGHT_RUNNERS: &[&str] = &[PERFORMX_RUNNER, COMPATX_RUNNER, SECUREX_RUNNER];

/// The built-in adapters.
pub fn register_extensions() -> Vec<Extension> {
    vec![
        Extension {
            extension_id: "repox",
            runner_id: REPOX_RUNNER,
            family: RunnerFamily::Policy,
            artifact_contract: &[
                "docs/audit/proof_manifest.json",
                "docs/audit/repox/REPOX_PROFILE.json",
            ],
            scope_subtrees: &["data", "docs", "schema", "scripts"],
            cost_class: CostClass::Low,
            tool_version: "repox-1",
            command: &[
                "python",
                "scripts/ci/check_repox_rules.py",
                "--repo-root",
                "{repo_root}",
                "--profile",
                "{profile}",
            ],
        },
        Extension {
            extension_id: "testx",
            runner_id: TESTX_RUNNER,
            family: RunnerFamily::Tests,
            artifact_contract: &[
                "docs/audit/testx/TESTX_RUN_META.json",
                "docs/audit/testx/TESTX_SUMMARY.json",
            ],
            scope_subtrees: &["engine", "game", "tests", "tools"],
            cost_class: CostClass::Medium,
            tool_version: "testx-1",
            command: &[
                "python",
                "tools/xstack/testx/runner.py",
                "--repo-root",
                "{repo_root}",
                "--profile",
                "{profile}",
            ],
        },
        Extension {
            extension_id: "auditx",
            runner_id: AUDITX_RUNNER,
            family: RunnerFamily::Audit,
            artifact_contract: &[
                "docs/audit/auditx/FINDINGS.json",
                "docs/audit/auditx/INVARIANT_MAP.json",
                "docs/audit/auditx/PROMOTION_CANDIDATES.json",
            ],
            scope_subtrees: &["data", "docs", "schema", "scripts", "tools"],
            cost_class: CostClass::Medium,
            tool_version: "auditx-1",
            command: &[
                "python",
                "tools/auditx/auditx.py",
                "scan",
                "--repo-root",
                "{repo_root}",
                "--format",
                "json",
            ],
        },
        Extension {
            extension_id: "performx",
            runner_id: PERFORMX_RUNNER,
            family: RunnerFamily::Performance,
            artifact_contract: &[
                "docs/audit/performance/PERFORMX_REGRESSIONS.json",
                "docs/audit/performance/PERFORMX_RESULTS.json",
            ],
            scope_subtrees: &["engine", "game"],
            cost_class: CostClass::High,
            tool_version: "performx-1",
            command: &[
                "python",
                "tools/performx/performx.py",
                "run",
                "--repo-root",
                "{repo_root}",
            ],
        },
        Extension {
            extension_id: "compatx",
            runner_id: COMPATX_RUNNER,
            family: RunnerFamily::Compatibility,
            artifact_contract: &["docs/audit/compat/COMPAT_BASELINE.json"],
            scope_subtrees: &["data", "schema"],
            cost_class: CostClass::High,
            tool_version: "compatx-1",
            command: &[
                "python",
                "tools/compatx/compatx.py",
                "verify",
                "--repo-root",
                "{repo_root}",
            ],
        },
        Extension {
            extension_id: "securex",
            runner_id: SECUREX_RUNNER,
            family: RunnerFamily::Security,
            artifact_contract: &[
                "docs/audit/security/FINDINGS.json",
                "docs/audit/security/INTEGRITY_MANIFEST.json",
            ],
            scope_subtrees: &["data", "scripts", "tools"],
            cost_class: CostClass::High,
            tool_version: "securex-1",
            command: &[
                "python",
                "tools/securex/securex.py",
                "scan",
                "--repo-root",
                "{repo_root}",
            ],
        },
    ]
}

/// Registry keyed by runner id, populated on first use.
pub fn extension_registry() -> &'static BTreeMap<&'static str, Extension> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, Extension>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        register_extensions()
            .into_iter()
            .map(|ext| (ext.runner_id, ext))
            .collect()
    })
}

/// Family for a runner id; `testx.*` and `auditx.*` group ids map onto their family.
pub fn family_for_runner(runner_id: &str) -> Option<RunnerFamily> {
    if let Some(ext) = extension_registry().get(runner_id) {
        return Some(ext.family);
    }
    if runner_id.starts_with("testx.") {
        return Some(RunnerFamily::Tests);
    }
    if runner_id.starts_with("auditx.") {
        return Some(RunnerFamily::Audit);
    }
    None
}

/// The extension backing a runner id, resolving group ids through their family.
pub fn extension_for_runner(runner_id: &str) -> Option<&'static Extension> {
    let registry = extension_registry();
    if let Some(ext) = registry.get(runner_id) {
        return Some(ext);
    }
    let family = family_for_runner(runner_id)?;
    registry.values().find(|ext| ext.family == family)
}

/// Resolve a runner's tool version, letting `overrides` replace the built-in value.
///
/// Returns `None` when neither source yields a non-empty version.
pub fn tool_version_for(runner_id: &str, overrides: &BTreeMap<String, String>) -> Option<String> {
    let ext = extension_for_runner(runner_id);
    let candidates = [
        overrides.get(runner_id).cloned(),
        ext.and_then(|ext| overrides.get(ext.runner_id).cloned()),
        ext.map(|ext| ext.tool_version.to_string()),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(|version| version.trim().to_string())
        .find(|version| !version.is_empty())
}

/// Work units for a runner id; unknown runners count as medium.
pub fn work_units_for(runner_id: &str) -> u64 {
    extension_for_runner(runner_id)
        .map(|ext| ext.cost_class.work_units())
        .unwrap_or(CostClass::Medium.work_units())
}
