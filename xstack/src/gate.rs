//! End-to-end gate invocation: resolve, plan, execute, record.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::refusal::Refusal;
use crate::core::types::ExecutionPlan;
use crate::io::artifact_contract::ArtifactContract;
use crate::io::config::{XStackConfig, load_repo_config};
use crate::io::env::Env;
use crate::io::ledger::{
    EntryInputs, LedgerRecord, append_entry, build_entry, canonical_artifact_hashes,
};
use crate::io::live_log::{LiveEvent, LiveLog};
use crate::io::profiler::Profiler;
use crate::io::runner::{CommandRunner, NodeRunner};
use crate::io::workspace::{
    Platform, WorkspaceDirs, canonical_workspace_dirs, canonical_workspace_id,
    resolve_repo_root, sanitize_workspace_id,
};
use crate::plan::{PlanRequest, build_execution_plan};
use crate::scheduler::{ExecutionContext, ExecutionSummary, execute_plan};

/// Gate commands accepted by [`run_gate`].
pub const GATE_COMMANDS: &[&str] = &["verify", "strict", "full", "dist", "snapshot"];

/// Where a gate runs: repo, config, cache root, and workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSession {
    pub repo_root: PathBuf,
    pub config: XStackConfig,
    pub cache_root: PathBuf,
    pub workspace_id: String,
}

/// Overrides a caller may supply when resolving a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOverrides {
    pub repo_root: Option<PathBuf>,
    pub workspace_id: Option<String>,
    pub cache_root: Option<PathBuf>,
}

impl GateSession {
    /// Resolve the repo root (explicit, else from `cwd`/`exe`), config, cache
    /// root, and workspace id.
    pub fn resolve(
        overrides: &SessionOverrides,
        cwd: &Path,
        exe_path: Option<&Path>,
        env: &Env,
    ) -> Result<Self> {
        let repo_root = match &overrides.repo_root {
            Some(root) => root
                .canonicalize()
                .map_err(|err| Refusal::RepoRootUnresolved(format!("{}: {err}", root.display())))?,
            None => resolve_repo_root(cwd, exe_path)?,
        };
        let config = load_repo_config(&repo_root)?;
        let cache_root = match &overrides.cache_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => cwd.join(root),
            None => config.cache_root(&repo_root),
        };
        let workspace_id = overrides
            .workspace_id
            .as_deref()
            .map(sanitize_workspace_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| canonical_workspace_id(&repo_root, env));
        debug!(
            repo_root = %repo_root.display(),
            cache_root = %cache_root.display(),
            workspace_id = %workspace_id,
            "session resolved"
        );
        Ok(Self {
            repo_root,
            config,
            cache_root,
            workspace_id,
        })
    }

    pub fn workspace_dirs(&self) -> Result<WorkspaceDirs> {
        let platform = Platform::current()?;
        Ok(canonical_workspace_dirs(
            &self.repo_root,
            &self.workspace_id,
            platform,
            std::env::consts::ARCH,
        ))
    }
}

/// Flags for one gate run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateOptions {
    pub gate_command: String,
    /// Profile override; empty resolves from policy.
    pub profile: String,
    pub only_gates: Vec<String>,
    pub profile_report: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub plan: ExecutionPlan,
    pub summary: ExecutionSummary,
    pub ledger: LedgerRecord,
}

/// Build the plan for `options` without executing it.
pub fn plan_gate(
    session: &GateSession,
    options: &GateOptions,
    env: &Env,
    profiler: &Profiler,
) -> Result<ExecutionPlan> {
    if !GATE_COMMANDS.contains(&options.gate_command.as_str()) {
        return Err(Refusal::PlanInputsMalformed(format!(
            "unknown gate command '{}'",
            options.gate_command
        ))
        .into());
    }
    let request = PlanRequest {
        repo_root: &session.repo_root,
        gate_command: &options.gate_command,
        requested_profile: &options.profile,
        workspace_id: &session.workspace_id,
        cache_root: &session.cache_root,
        only_gates: &options.only_gates,
        config: &session.config,
        env,
    };
    profiler.time("plan", || build_execution_plan(&request))
}

/// Plan, execute, and record one gate invocation.
///
/// `runner` defaults to the process-backed [`CommandRunner`].
#[instrument(skip_all, fields(gate_command = %options.gate_command))]
pub fn run_gate(
    session: &GateSession,
    options: &GateOptions,
    env: &Env,
    live: &LiveLog,
    runner: Option<&dyn NodeRunner>,
    cancel: Option<&AtomicBool>,
) -> Result<GateOutcome> {
    let profiler = Profiler::new();
    profiler.start_phase("gate", Some(json!({"gate_command": options.gate_command})));

    session
        .workspace_dirs()?
        .create_all()
        .context("create workspace directories")?;

    let plan = live_phase(live, "plan", || plan_gate(session, options, env, &profiler))?;
    emit_plan(live, &plan);

    let command_runner = CommandRunner {
        cache_root: session.cache_root.clone(),
        interpreter: session.config.interpreter.clone(),
        output_limit_bytes: session.config.output_limit_bytes,
        base_env: env.clone(),
    };
    let runner: &dyn NodeRunner = match runner {
        Some(runner) => runner,
        None => &command_runner,
    };
    let cpu_count = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1);
    let exec = ExecutionContext {
        repo_root: &session.repo_root,
        workspace_id: &session.workspace_id,
        cache_root: &session.cache_root,
        runner,
        live,
        profiler: &profiler,
        cancel,
        max_workers: session.config.max_workers(env, cpu_count),
        profile_report: options.profile_report,
        tool_versions: &session.config.tool_versions,
    };
    let mut summary = live_phase(live, "execute", || execute_plan(&plan, &exec))?;

    let ledger = live_phase(live, "ledger", || {
        profiler.time("ledger", || record_ledger(session, &plan, &summary))
    });
    profiler.end_phase("gate", None);
    if options.profile_report {
        summary.profile_report = Some(profiler.snapshot());
        let path = profile_report_path(&session.cache_root, &plan.plan_hash);
        if let Err(err) = profiler.export_json(
            &path,
            Some(json!({
                "gate_command": options.gate_command,
                "plan_hash": plan.plan_hash,
                "workspace_id": session.workspace_id,
            })),
        ) {
            warn!(err = %format!("{err:#}"), "profile report not written");
        }
    }

    emit_outcome(live, &summary);
    info!(
        exit_code = summary.exit_code,
        entry_hash = %ledger.entry_hash,
        "gate finished"
    );
    Ok(GateOutcome {
        plan,
        summary,
        ledger,
    })
}

/// `<cache_root>/plans/<plan_hash>.profile.json`.
pub fn profile_report_path(cache_root: &Path, plan_hash: &str) -> PathBuf {
    cache_root.join("plans").join(format!("{plan_hash}.profile.json"))
}

fn live_phase<T>(live: &LiveLog, phase: &str, f: impl FnOnce() -> T) -> T {
    live.emit(LiveEvent::PhaseStart, json!({"phase": phase}));
    let started = Instant::now();
    let out = f();
    let duration_s = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
    live.emit(
        LiveEvent::PhaseEnd,
        json!({"phase": phase, "duration_s": duration_s}),
    );
    out
}

fn emit_plan(live: &LiveLog, plan: &ExecutionPlan) {
    live.emit(
        LiveEvent::PlanSummary,
        json!({
            "plan_hash": plan.plan_hash,
            "profile": plan.profile.as_str(),
            "strict_variant": plan.strict_variant.map(|variant| variant.as_str()),
            "nodes": plan.nodes.len(),
            "work_units": plan.estimate.work_units,
            "parallel_bucket_max": plan.estimate.parallel_bucket_max,
            "changed_paths": plan.impact.changed_paths.len(),
        }),
    );
    for node in &plan.nodes {
        live.emit(
            LiveEvent::PlanExplain,
            json!({
                "node": node.node_id,
                "runner": node.runner_id,
                "level": node.level,
                "reason": plan.explain.get(&node.node_id).cloned().unwrap_or_default(),
            }),
        );
    }
    if plan.estimate.warn_full_plan_too_large {
        live.emit(
            LiveEvent::EscalationTrigger,
            json!({
                "reason": "full_plan_too_large",
                "work_units": plan.estimate.work_units,
            }),
        );
    }
}

fn emit_outcome(live: &LiveLog, summary: &ExecutionSummary) {
    let phases = summary
        .profile_report
        .as_ref()
        .map(|report| report.cumulative.len());
    live.emit(
        LiveEvent::ProfileSummary,
        json!({
            "total_seconds": summary.total_seconds,
            "cache_hits": summary.cache_hits,
            "cache_misses": summary.cache_misses,
            "results": summary.results.len(),
            "skipped": summary.skipped.len(),
            "phases": phases,
        }),
    );
    for failure in summary.failures() {
        live.emit(
            LiveEvent::FailureSummary,
            json!({
                "runner": failure.runner_id,
                "node": failure.node_id,
                "exit_code": failure.exit_code,
                "cache_hit": failure.cache_hit,
            }),
        );
    }
}

/// Failure class recorded in the ledger.
pub fn failure_class(summary: &ExecutionSummary) -> String {
    if summary.interrupted {
        "interrupted".to_string()
    } else if summary.failures().next().is_some() {
        "runner_failure".to_string()
    } else {
        String::new()
    }
}

fn record_ledger(
    session: &GateSession,
    plan: &ExecutionPlan,
    summary: &ExecutionSummary,
) -> LedgerRecord {
    let contract =
        ArtifactContract::load(&session.repo_root, &session.config.registries.derived_artifacts);
    let produced: Vec<String> = summary
        .results
        .iter()
        .flat_map(|result| result.artifacts_produced.iter().cloned())
        .collect();
    let inputs = EntryInputs {
        repo_state_hash: plan.repo_state_hash.clone(),
        plan_hash: plan.plan_hash.clone(),
        profile: plan.profile.as_str().to_string(),
        runner_ids: summary
            .results
            .iter()
            .map(|result| result.runner_id.clone())
            .collect(),
        cache_hits: summary.cache_hits,
        cache_misses: summary.cache_misses,
        artifact_hashes: canonical_artifact_hashes(&session.repo_root, &contract, &produced),
        failure_class: failure_class(summary),
        duration_s: summary.total_seconds,
        workspace_id: session.workspace_id.clone(),
    };
    match build_entry(inputs) {
        Ok(entry) => append_entry(&session.cache_root, &entry),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "ledger entry not built");
            LedgerRecord::default()
        }
    }
}
