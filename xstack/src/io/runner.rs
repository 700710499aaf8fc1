//! Runner adapters: the contract between a plan node and a process.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::canonical::{canonical_hash, sha256_hex};
use crate::core::extensions::family_for_runner;
use crate::core::refusal::Refusal;
use crate::core::routing::{
    SNAPSHOT_GATE_COMMAND, artifact_dir_name, coerce_optional_refusal, format_argv, route_output,
};
use crate::core::types::{PlanNode, Profile, RunnerResult};
use crate::io::env::Env;
use crate::io::process::{is_spawn_failure, run_to_completion};
use crate::io::workspace::canonicalize_env_for_workspace;

/// Exit code recorded when the runner process could not be spawned.
pub const EXIT_COMMAND_UNRESOLVABLE: i32 = 127;
/// Exit code recorded for an empty or malformed node command.
pub const EXIT_INVALID_COMMAND: i32 = 2;

/// Everything a runner sees about the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerContext {
    pub repo_root: PathBuf,
    pub workspace_id: String,
    pub gate_command: String,
    pub node: PlanNode,
    pub plan_profile: Profile,
    pub repo_state_hash: String,
}

impl RunnerContext {
    pub fn snapshot_mode(&self) -> bool {
        self.gate_command == SNAPSHOT_GATE_COMMAND
    }
}

/// Executes one plan node. Implementations are shared across worker threads.
pub trait NodeRunner: Sync {
    fn run(&self, ctx: &RunnerContext) -> RunnerResult;
}

/// UTC timestamp with seconds precision and a `Z` suffix.
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// `sha256(canonical-json({exit_code, output, artifacts}))`.
pub fn output_hash(exit_code: i32, output: &str, artifacts: &[String]) -> String {
    let payload = json!({
        "exit_code": exit_code,
        "output": output,
        "artifacts": artifacts,
    });
    canonical_hash(&payload).unwrap_or_else(|_| sha256_hex(payload.to_string()))
}

/// Build a [`RunnerResult`] with sorted artifacts and a fresh timestamp.
pub fn normalize_result(
    node: &PlanNode,
    exit_code: i32,
    output: String,
) -> RunnerResult {
    let mut artifacts = node.expected_artifacts.clone();
    artifacts.sort();
    artifacts.dedup();
    RunnerResult {
        runner_id: node.runner_id.clone(),
        exit_code,
        output_hash: output_hash(exit_code, &output, &artifacts),
        output,
        artifacts_produced: artifacts,
        timestamp_utc: utc_timestamp(),
        never_ran: false,
    }
}

/// Like [`normalize_result`], for a node whose process never ran.
pub fn never_ran_result(node: &PlanNode, exit_code: i32, output: String) -> RunnerResult {
    RunnerResult {
        never_ran: true,
        ..normalize_result(node, exit_code, output)
    }
}

/// The default adapter: a process invocation with routed output.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    pub cache_root: PathBuf,
    pub interpreter: String,
    pub output_limit_bytes: usize,
    /// Environment the canonical runner environment is derived from.
    pub base_env: Env,
}

impl CommandRunner {
    /// `<cache_root>/artifacts/<workspace_id>/<group_id or runner_id>`.
    pub fn artifact_dir(&self, ctx: &RunnerContext) -> PathBuf {
        routed_artifact_dir(&self.cache_root, &ctx.workspace_id, &ctx.node)
    }

    /// Formatted and routed argv; creates the artifact directory unless in snapshot mode.
    pub fn prepare_argv(&self, ctx: &RunnerContext) -> Result<Vec<String>> {
        let argv = format_argv(
            &ctx.node.command,
            &ctx.repo_root.display().to_string(),
            ctx.plan_profile.as_str(),
            &self.interpreter,
        )?;
        if ctx.snapshot_mode() {
            return Ok(argv);
        }
        let family = family_for_runner(&ctx.node.runner_id);
        let artifact_dir = self.artifact_dir(ctx);
        if family.is_some() {
            fs::create_dir_all(&artifact_dir)
                .with_context(|| format!("create artifact dir {}", artifact_dir.display()))?;
        }
        Ok(route_output(argv, &ctx.gate_command, family, &artifact_dir))
    }

    /// Canonical workspace environment plus the orchestrator's mode variables.
    pub fn runner_env(&self, ctx: &RunnerContext) -> Result<Env> {
        let mut env =
            canonicalize_env_for_workspace(&self.base_env, &ctx.repo_root, &ctx.workspace_id)?;
        env.insert(
            "DOM_XSTACK_SNAPSHOT_MODE".to_string(),
            if ctx.snapshot_mode() { "1" } else { "0" }.to_string(),
        );
        env.insert(
            "DOM_XSTACK_GATE_COMMAND".to_string(),
            ctx.gate_command.clone(),
        );
        Ok(env)
    }

    /// `Err` carries the exit code and message for a process that never ran.
    fn execute(&self, ctx: &RunnerContext) -> Result<(i32, String), (i32, String)> {
        let argv = self
            .prepare_argv(ctx)
            .map_err(|err| (refusal_exit_code(&err), format!("{err:#}")))?;
        let env = self
            .runner_env(ctx)
            .map_err(|err| (EXIT_INVALID_COMMAND, format!("{err:#}")))?;
        let Some((program, args)) = argv.split_first() else {
            return Err((
                EXIT_INVALID_COMMAND,
                Refusal::InvalidRunnerCommand("empty command".to_string()).to_string(),
            ));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&ctx.repo_root)
            .env_clear()
            .envs(&env);
        debug!(argv = ?argv, "runner argv");

        let out = match run_to_completion(cmd, self.output_limit_bytes) {
            Ok(out) => out,
            Err(err) if is_spawn_failure(&err) => {
                let refusal = Refusal::CommandUnresolvable(format!("{program}: {err:#}"));
                warn!(runner = %ctx.node.runner_id, "{refusal}");
                return Err((EXIT_COMMAND_UNRESOLVABLE, refusal.to_string()));
            }
            Err(err) => return Err((1, format!("{err:#}"))),
        };
        if let Some((code, annotated)) =
            coerce_optional_refusal(&ctx.node.runner_id, out.exit_code, &out.stdout_text())
        {
            info!(
                runner = %ctx.node.runner_id,
                original_exit_code = out.exit_code,
                "optional bundle refusal coerced to non-gating skip"
            );
            return Ok((code, annotated));
        }
        Ok((out.exit_code, out.merged()))
    }
}

impl NodeRunner for CommandRunner {
    #[instrument(skip_all, fields(node = %ctx.node.node_id))]
    fn run(&self, ctx: &RunnerContext) -> RunnerResult {
        match self.execute(ctx) {
            Ok((exit_code, output)) => {
                debug!(exit_code, "runner finished");
                normalize_result(&ctx.node, exit_code, output)
            }
            Err((exit_code, output)) => {
                debug!(exit_code, "runner did not start");
                never_ran_result(&ctx.node, exit_code, output)
            }
        }
    }
}

fn refusal_exit_code(err: &anyhow::Error) -> i32 {
    match crate::core::refusal::find_refusal(err) {
        Some(Refusal::CommandUnresolvable(_)) => EXIT_COMMAND_UNRESOLVABLE,
        _ => EXIT_INVALID_COMMAND,
    }
}

/// Where a node's routed artifacts land; one subtree per workspace.
pub fn routed_artifact_dir(cache_root: &Path, workspace_id: &str, node: &PlanNode) -> PathBuf {
    cache_root
        .join("artifacts")
        .join(workspace_id)
        .join(artifact_dir_name(&node.runner_id, &node.group_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn node(runner_id: &str, command: &[&str]) -> PlanNode {
        PlanNode {
            node_id: runner_id.to_string(),
            runner_id: runner_id.to_string(),
            group_id: String::new(),
            command: command.iter().map(|t| t.to_string()).collect(),
            expected_artifacts: vec![
                "docs/audit/b.json".to_string(),
                "docs/audit/a.json".to_string(),
            ],
            parallelizable: false,
            depends_on: BTreeSet::new(),
            level: 0,
        }
    }

    fn ctx(repo_root: &Path, gate_command: &str, node: PlanNode) -> RunnerContext {
        RunnerContext {
            repo_root: repo_root.to_path_buf(),
            workspace_id: "ws.test".to_string(),
            gate_command: gate_command.to_string(),
            node,
            plan_profile: Profile::Fast,
            repo_state_hash: "R".to_string(),
        }
    }

    fn runner(repo_root: &Path) -> CommandRunner {
        CommandRunner {
            cache_root: repo_root.join(".xstack_cache"),
            interpreter: "python3".to_string(),
            output_limit_bytes: 1 << 20,
            base_env: Env::new(),
        }
    }

    #[test]
    fn policy_runner_output_is_routed_into_artifact_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let repo = root.display().to_string();
        let base = node(
            "repox_runner",
            &["python", "check.py", "--repo-root", &repo, "--profile", "FAST"],
        );
        let runner = runner(root);
        let argv = runner
            .prepare_argv(&ctx(root, "verify", base.clone()))
            .expect("argv");
        let dir = root.join(".xstack_cache/artifacts/ws.test/repox_runner");
        let flag_value = |flag: &str| {
            let index = argv.iter().position(|t| t == flag).expect("flag present");
            PathBuf::from(&argv[index + 1])
        };
        assert_eq!(flag_value("--proof-manifest-out"), dir.join("proof_manifest.json"));
        assert_eq!(flag_value("--profile-out"), dir.join("REPOX_PROFILE.json"));
        assert!(dir.is_dir());

        let snapshot = runner
            .prepare_argv(&ctx(root, "snapshot", base))
            .expect("argv");
        assert_eq!(
            snapshot,
            vec!["python3", "check.py", "--repo-root", repo.as_str(), "--profile", "FAST"]
        );
    }

    #[test]
    fn existing_flags_are_not_duplicated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let base = node("securex_runner", &["securex", "--output-dir=/elsewhere"]);
        let argv = runner(root)
            .prepare_argv(&ctx(root, "full", base))
            .expect("argv");
        assert_eq!(argv, vec!["securex", "--output-dir=/elsewhere"]);
    }

    #[test]
    fn runner_env_sets_mode_variables() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let env = runner(root)
            .runner_env(&ctx(root, "snapshot", node("repox_runner", &["x"])))
            .expect("env");
        assert_eq!(env["DOM_XSTACK_SNAPSHOT_MODE"], "1");
        assert_eq!(env["DOM_XSTACK_GATE_COMMAND"], "snapshot");
        assert_eq!(env["DOM_WS_ID"], "ws.test");
    }

    #[test]
    fn empty_command_is_recorded_as_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result =
            runner(temp.path()).run(&ctx(temp.path(), "verify", node("repox_runner", &[])));
        assert_eq!(result.exit_code, EXIT_INVALID_COMMAND);
        assert!(result.output.starts_with("refuse.invalid_runner_command"));
        assert_eq!(result.artifacts_produced, vec!["docs/audit/a.json", "docs/audit/b.json"]);
        assert!(result.never_ran);
    }

    #[test]
    fn routed_dirs_are_disjoint_per_workspace() {
        let cache_root = Path::new("/repo/.xstack_cache");
        let repox = node("repox_runner", &["x"]);
        let alpha = routed_artifact_dir(cache_root, "ws.alpha", &repox);
        let beta = routed_artifact_dir(cache_root, "ws.beta", &repox);
        assert_eq!(alpha, cache_root.join("artifacts/ws.alpha/repox_runner"));
        assert!(!alpha.starts_with(&beta) && !beta.starts_with(&alpha));
    }

    #[test]
    fn output_hash_covers_exit_output_and_artifacts() {
        let artifacts = vec!["a".to_string()];
        let base = output_hash(0, "ok", &artifacts);
        assert_eq!(base, output_hash(0, "ok", &artifacts));
        assert_ne!(base, output_hash(1, "ok", &artifacts));
        assert_ne!(base, output_hash(0, "ok!", &artifacts));
        assert_ne!(base, output_hash(0, "ok", &[]));
    }

    #[cfg(unix)]
    #[test]
    fn unspawnable_command_records_127() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = runner(temp.path()).run(&ctx(
            temp.path(),
            "verify",
            node("custom_runner", &["/nonexistent/xstack-tool"]),
        ));
        assert_eq!(result.exit_code, EXIT_COMMAND_UNRESOLVABLE);
        assert!(result.output.starts_with("refuse.command_unresolvable"));
        assert!(result.never_ran);
    }

    #[cfg(unix)]
    #[test]
    fn runs_process_with_canonical_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = runner(temp.path()).run(&ctx(
            temp.path(),
            "verify",
            node(
                "custom_runner",
                &["/bin/sh", "-c", "echo $DOM_XSTACK_GATE_COMMAND; echo warn 1>&2; exit 4"],
            ),
        ));
        assert_eq!(result.exit_code, 4);
        assert_eq!(result.output, "verify\nwarn\n");
        assert_eq!(result.runner_id, "custom_runner");
        assert!(!result.never_ran);
    }

    #[cfg(unix)]
    #[test]
    fn compat_optional_refusal_becomes_non_gating() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"echo '{"result":"refused","refusal_codes":["refuse.bundle_optional_flag"]}'; exit 3"#;
        let result = runner(temp.path()).run(&ctx(
            temp.path(),
            "full",
            node("compatx_runner", &["/bin/sh", "-c", script, "--"]),
        ));
        assert_eq!(result.exit_code, 0);
        let payload: serde_json::Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["result"], "skipped_optional");
        assert_eq!(payload["non_gating"], true);
        assert_eq!(payload["original_exit_code"], 3);
    }
}
