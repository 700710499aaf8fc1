//! Change-set to group/subsystem/runner mapping.
//!
//! Deriving the changed paths needs git and the artifact contract; that lives
//! in `io::impact`. This module only matches an already-filtered change set
//! against the registries.

use std::collections::{BTreeMap, BTreeSet};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use super::extensions::{AUDITX_RUNNER, REPOX_RUNNER, TESTX_RUNNER};
use super::paths::{
    has_fixed_skip_component, is_tool_cache_path, is_under, normalize_rel, top_level_dir,
};
use super::refusal::Refusal;
use super::types::{ComponentSpec, GroupSpec, ImpactGraph};

/// Baseline TestX group forced into quiet workspaces.
pub const CORE_INVARIANTS_GROUP: &str = "testx.group.core.invariants";
/// Baseline AuditX group forced into quiet workspaces.
pub const CORE_POLICY_GROUP: &str = "auditx.group.core.policy";

/// Top-level directories that name a subsystem; everything else folds into `misc`.
pub const KNOWN_SUBSYSTEMS: &[&str] = &[
    "app", "client", "data", "docs", "engine", "game", "libs", "schema", "scripts", "server",
    "tests", "tools",
];

/// Audit output and cache roots never count as changes.
pub const IMPACT_EXCLUDED_PREFIXES: &[&str] = &["docs/audit/", ".xstack_cache/"];

/// Impact graph plus the reason each group was included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpactAnalysis {
    pub graph: ImpactGraph,
    pub reasons: BTreeMap<String, String>,
}

/// Normalize, de-duplicate, sort, and drop excluded paths.
///
/// `skip_set` holds the artifact-contract paths excluded from hashing;
/// `extra_excluded` holds session prefixes such as an in-repo cache root.
pub fn filter_changed_paths(
    raw: &[String],
    skip_set: &BTreeSet<String>,
    extra_excluded: &[String],
) -> Vec<String> {
    let mut kept: BTreeSet<String> = BTreeSet::new();
    for path in raw {
        let path = normalize_rel(path);
        if path.is_empty()
            || has_fixed_skip_component(&path)
            || is_tool_cache_path(&path)
            || IMPACT_EXCLUDED_PREFIXES
                .iter()
                .any(|prefix| is_under(&path, prefix))
            || skip_set.iter().any(|skip| is_under(&path, skip))
            || extra_excluded.iter().any(|prefix| is_under(&path, prefix))
        {
            continue;
        }
        kept.insert(path);
    }
    kept.into_iter().collect()
}

/// Coarse subsystem for a path.
pub fn subsystem_for_path(path: &str) -> &'static str {
    let head = top_level_dir(path);
    KNOWN_SUBSYSTEMS
        .iter()
        .find(|known| **known == head)
        .copied()
        .unwrap_or("misc")
}

/// Compiled glob patterns for one group.
struct GroupMatcher {
    group_id: String,
    patterns: Vec<String>,
    set: GlobSet,
}

impl GroupMatcher {
    fn compile(spec: &GroupSpec) -> Result<Self, Refusal> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &spec.patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| {
                    Refusal::PlanInputsMalformed(format!(
                        "group '{}' pattern '{pattern}': {err}",
                        spec.group_id
                    ))
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|err| {
            Refusal::PlanInputsMalformed(format!("group '{}': {err}", spec.group_id))
        })?;
        Ok(Self {
            group_id: spec.group_id.clone(),
            patterns: spec.patterns.clone(),
            set,
        })
    }

    /// First changed path (in sorted order) matched, with the pattern that hit.
    fn first_match(&self, changed: &[String]) -> Option<(String, String)> {
        changed.iter().find_map(|path| {
            let hits = self.set.matches(path);
            hits.first()
                .map(|index| (path.clone(), self.patterns[*index].clone()))
        })
    }
}

fn match_groups(
    groups: &[GroupSpec],
    changed: &[String],
    reasons: &mut BTreeMap<String, String>,
) -> Result<BTreeSet<String>, Refusal> {
    let mut impacted = BTreeSet::new();
    for spec in groups {
        let matcher = GroupMatcher::compile(spec)?;
        if let Some((path, pattern)) = matcher.first_match(changed) {
            reasons.insert(
                matcher.group_id.clone(),
                format!("changed path '{path}' matches '{pattern}'"),
            );
            impacted.insert(matcher.group_id);
        }
    }
    Ok(impacted)
}

/// Map a filtered change set onto groups, subsystems, and required runners.
pub fn derive_impact(
    changed_paths: &[String],
    testx_groups: &[GroupSpec],
    auditx_groups: &[GroupSpec],
    components: &[ComponentSpec],
) -> Result<ImpactAnalysis, Refusal> {
    let mut changed: Vec<String> = changed_paths.to_vec();
    changed.sort();
    changed.dedup();

    let mut reasons = BTreeMap::new();
    let mut testx = match_groups(testx_groups, &changed, &mut reasons)?;
    let mut auditx = match_groups(auditx_groups, &changed, &mut reasons)?;

    if changed.is_empty() {
        for baseline in [CORE_INVARIANTS_GROUP, CORE_POLICY_GROUP] {
            reasons.insert(
                baseline.to_string(),
                "quiet workspace baseline".to_string(),
            );
        }
        testx.insert(CORE_INVARIANTS_GROUP.to_string());
        auditx.insert(CORE_POLICY_GROUP.to_string());
    }

    let subsystems: BTreeSet<String> = changed
        .iter()
        .map(|path| subsystem_for_path(path).to_string())
        .collect();

    let mut runners: BTreeSet<String> = [REPOX_RUNNER, TESTX_RUNNER, AUDITX_RUNNER]
        .iter()
        .map(|runner| runner.to_string())
        .collect();
    for component in components {
        if component
            .subsystems
            .iter()
            .any(|subsystem| subsystems.contains(subsystem))
        {
            runners.extend(component.runners.iter().cloned());
        }
    }

    Ok(ImpactAnalysis {
        graph: ImpactGraph {
            changed_paths: changed,
            impacted_subsystems: subsystems.into_iter().collect(),
            impacted_testx_groups: testx.into_iter().collect(),
            impacted_auditx_groups: auditx.into_iter().collect(),
            required_runners: runners.into_iter().collect(),
        },
        reasons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, patterns: &[&str]) -> GroupSpec {
        GroupSpec {
            group_id: id.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            default_profile: "FAST".to_string(),
            command: None,
            parallelizable: None,
        }
    }

    #[test]
    fn quiet_workspace_forces_baseline_groups() {
        let analysis = derive_impact(&[], &[], &[], &[]).expect("impact");
        assert_eq!(
            analysis.graph.impacted_testx_groups,
            vec![CORE_INVARIANTS_GROUP.to_string()]
        );
        assert_eq!(
            analysis.graph.impacted_auditx_groups,
            vec![CORE_POLICY_GROUP.to_string()]
        );
        assert_eq!(
            analysis.graph.required_runners,
            vec!["auditx_runner", "repox_runner", "testx_runner"]
        );
    }

    #[test]
    fn globs_match_groups_and_components_add_runners() {
        let changed = vec!["engine/core/world.c".to_string(), "README.md".to_string()];
        let testx = vec![
            group("testx.group.engine", &["engine/**"]),
            group("testx.group.ui", &["client/**"]),
        ];
        let components = vec![ComponentSpec {
            component_id: "engine".to_string(),
            subsystems: vec!["engine".to_string()],
            runners: vec!["performx_runner".to_string()],
        }];
        let analysis = derive_impact(&changed, &testx, &[], &components).expect("impact");
        assert_eq!(analysis.graph.impacted_testx_groups, vec!["testx.group.engine"]);
        assert!(analysis.graph.impacted_auditx_groups.is_empty());
        assert_eq!(analysis.graph.impacted_subsystems, vec!["engine", "misc"]);
        assert!(analysis.graph.required_runners.contains(&"performx_runner".to_string()));
        assert!(analysis.reasons["testx.group.engine"].contains("engine/core/world.c"));
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let changed = vec!["engine/core/world.c".to_string()];
        let testx = vec![group("testx.group.shallow", &["engine/*.c"])];
        let analysis = derive_impact(&changed, &testx, &[], &[]).expect("impact");
        assert!(analysis.graph.impacted_testx_groups.is_empty());
    }

    #[test]
    fn invalid_glob_is_refused() {
        let testx = vec![group("testx.group.bad", &["engine/[unclosed"])];
        let err = derive_impact(&["engine/a.c".to_string()], &testx, &[], &[]).unwrap_err();
        assert_eq!(err.code(), "refuse.plan_inputs_malformed");
    }

    #[test]
    fn filter_drops_audit_cache_and_contract_paths() {
        let raw = vec![
            "docs/audit/testx/TESTX_SUMMARY.json".to_string(),
            ".xstack_cache/plans/x.json".to_string(),
            "tools/auditx/cache/index.json".to_string(),
            "docs/views/index.md".to_string(),
            "./engine/a.c".to_string(),
            "engine/a.c".to_string(),
        ];
        let skip = BTreeSet::from(["docs/views".to_string()]);
        assert_eq!(filter_changed_paths(&raw, &skip, &[]), vec!["engine/a.c"]);
    }

    #[test]
    fn filter_drops_session_cache_prefix() {
        let raw = vec![
            ".cache_ws/merkle/roots.json".to_string(),
            ".cache_wsx/notes.md".to_string(),
            "engine/a.c".to_string(),
        ];
        let extra = vec![".cache_ws".to_string()];
        assert_eq!(
            filter_changed_paths(&raw, &BTreeSet::new(), &extra),
            vec![".cache_wsx/notes.md", "engine/a.c"]
        );
    }

    #[test]
    fn unknown_top_level_folds_into_misc() {
        assert_eq!(subsystem_for_path("engine/a.c"), "engine");
        assert_eq!(subsystem_for_path("vendor/x/y.c"), "misc");
        assert_eq!(subsystem_for_path("CMakeLists.txt"), "misc");
    }
}
