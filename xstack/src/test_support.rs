//! Test-only fixtures: scratch repositories, hand-built plans, and a scripted runner.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use crate::core::types::{ExecutionPlan, PlanEstimate, PlanNode, Profile, RunnerResult};
use crate::gate::{GateSession, SessionOverrides};
use crate::io::config::RegistryPaths;
use crate::io::env::Env;
use crate::io::git::Git;
use crate::io::runner::{NodeRunner, RunnerContext, normalize_result};
use crate::plan::{PLAN_SCHEMA_VERSION, order_nodes, plan_hash};

/// A scratch repository that satisfies the repo-root markers.
pub struct FixtureRepo {
    dir: TempDir,
}

impl FixtureRepo {
    /// `Cargo.toml`, `scripts/`, `docs/`, and one engine source file.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.write("Cargo.toml", "[package]\nname = \"fixture\"\n");
        repo.write("scripts/ci/check.sh", "#!/bin/sh\nexit 0\n");
        repo.write("docs/README.md", "fixture docs\n");
        repo.write("engine/core.c", "int core;\n");
        repo
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write fixture file");
    }

    /// Group registry at `rel`; each entry is `(group_id, patterns, default_profile)`.
    pub fn write_groups(&self, rel: &str, groups: &[(&str, &[&str], &str)]) {
        let groups: Vec<_> = groups
            .iter()
            .map(|(id, patterns, profile)| {
                json!({"group_id": id, "patterns": patterns, "default_profile": profile})
            })
            .collect();
        self.write(rel, &json!({"record": {"groups": groups}}).to_string());
    }

    pub fn write_testx_groups(&self, groups: &[(&str, &[&str], &str)]) {
        self.write_groups(&RegistryPaths::default().testx_groups, groups);
    }

    pub fn write_auditx_groups(&self, groups: &[(&str, &[&str], &str)]) {
        self.write_groups(&RegistryPaths::default().auditx_groups, groups);
    }

    /// Derived-artifact contract; each entry is `(artifact_id, path, class)`.
    pub fn write_derived_artifacts(&self, records: &[(&str, &str, &str)]) {
        let artifacts: Vec<_> = records
            .iter()
            .map(|(id, path, class)| {
                json!({"artifact_id": id, "path": path, "artifact_class": class})
            })
            .collect();
        self.write(
            &RegistryPaths::default().derived_artifacts,
            &json!({"record": {"artifacts": artifacts}}).to_string(),
        );
    }

    /// Gate policy; each entry is `(gate_command, profile)`.
    pub fn write_gate_policy(&self, modes: &[(&str, &str)]) {
        let modes: BTreeMap<&str, &str> = modes.iter().copied().collect();
        self.write(
            &RegistryPaths::default().gate_policy,
            &json!({"record": {"extensions": {"default_mode_by_command": modes}}}).to_string(),
        );
    }

    /// Initialize git and commit everything currently on disk.
    pub fn commit_all(&self, message: &str) -> Git {
        let git = Git::new(self.root());
        if !self.path(".git").exists() {
            git.init().expect("git init");
        }
        git.add_all().expect("git add");
        git.commit_staged(message).expect("git commit");
        git
    }

    /// Session rooted at this repo with an explicit workspace id.
    pub fn session(&self, workspace_id: &str) -> GateSession {
        let overrides = SessionOverrides {
            repo_root: Some(self.root().to_path_buf()),
            workspace_id: Some(workspace_id.to_string()),
            cache_root: None,
        };
        GateSession::resolve(&overrides, self.root(), None, &Env::new()).expect("session")
    }
}

impl Default for FixtureRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// A plan node with a trivial command and no artifacts.
pub fn node(node_id: &str, runner_id: &str, depends_on: &[&str], parallelizable: bool) -> PlanNode {
    PlanNode {
        node_id: node_id.to_string(),
        runner_id: runner_id.to_string(),
        group_id: String::new(),
        command: vec!["true".to_string()],
        expected_artifacts: Vec::new(),
        parallelizable,
        depends_on: depends_on.iter().map(|dep| dep.to_string()).collect::<BTreeSet<_>>(),
        level: 0,
    }
}

/// A node that declares `artifacts` as outputs.
pub fn writer(node_id: &str, runner_id: &str, depends_on: &[&str], artifacts: &[&str]) -> PlanNode {
    PlanNode {
        expected_artifacts: artifacts.iter().map(|path| path.to_string()).collect(),
        ..node(node_id, runner_id, depends_on, true)
    }
}

/// Order `nodes`, assign levels, and fingerprint a plan around them.
pub fn plan_from_nodes(profile: Profile, nodes: Vec<PlanNode>) -> ExecutionPlan {
    let nodes = order_nodes(nodes, &[]).expect("order nodes");
    let mut plan = ExecutionPlan {
        schema_version: PLAN_SCHEMA_VERSION.to_string(),
        gate_command: "verify".to_string(),
        profile,
        strict_variant: None,
        workspace_id: "ws.test".to_string(),
        repo_state_hash: "0".repeat(64),
        merkle_roots: BTreeMap::new(),
        impact: Default::default(),
        nodes,
        estimate: PlanEstimate::default(),
        explain: BTreeMap::new(),
        plan_hash: String::new(),
    };
    plan.plan_hash = plan_hash(&plan).expect("plan hash");
    plan
}

/// A [`NodeRunner`] with scripted exit codes that records every invocation.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    exit_codes: BTreeMap<String, i32>,
    delays: BTreeMap<String, Duration>,
    panics: BTreeSet<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` for `node_id` (default 0).
    pub fn exit(mut self, node_id: &str, code: i32) -> Self {
        self.exit_codes.insert(node_id.to_string(), code);
        self
    }

    /// Sleep before returning for `node_id`.
    pub fn delay(mut self, node_id: &str, delay: Duration) -> Self {
        self.delays.insert(node_id.to_string(), delay);
        self
    }

    /// Panic when `node_id` runs.
    pub fn panic_on(mut self, node_id: &str) -> Self {
        self.panics.insert(node_id.to_string());
        self
    }

    /// Node ids in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl NodeRunner for ScriptedRunner {
    fn run(&self, ctx: &RunnerContext) -> RunnerResult {
        let node_id = ctx.node.node_id.clone();
        self.calls.lock().expect("calls lock").push(node_id.clone());
        if let Some(delay) = self.delays.get(&node_id) {
            thread::sleep(*delay);
        }
        if self.panics.contains(&node_id) {
            panic!("scripted panic in {node_id}");
        }
        let code = self.exit_codes.get(&node_id).copied().unwrap_or(0);
        normalize_result(&ctx.node, code, format!("{node_id} exited {code}\n"))
    }
}

/// Cloneable in-memory sink for a live log.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().expect("buffer lock").clone()).expect("utf8")
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
