//! Deterministic parallel plan execution.
//!
//! A single controller owns readiness, the running set, and completed
//! results; a bounded pool of scoped worker threads only runs runners and
//! sends back finished [`RunnerResult`]s. At most `max_workers` runners are
//! in flight, so a fail-fast stop leaves everything else undispatched.
//! Dispatch order inside a readiness wave is `(level, runner_id, node_id)`,
//! and results are returned in that same order regardless of completion
//! timing. Results from runners that never started are not cached.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::canonical::canonical_hash;
use crate::core::extensions::tool_version_for;
use crate::core::profile::cache_profile_id;
use crate::core::types::{CacheEntry, ExecutionPlan, PlanNode, RunnerResult};
use crate::io::cache_store::{CacheKey, load_entry, store_entry};
use crate::io::live_log::{LiveEvent, LiveLog};
use crate::io::profiler::{ProfileSnapshot, Profiler};
use crate::io::runner::{NodeRunner, RunnerContext, never_ran_result};

/// Outcome of one plan node, from a runner or from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub runner_id: String,
    pub group_id: String,
    pub level: u32,
    pub exit_code: i32,
    pub output_hash: String,
    pub artifacts_produced: Vec<String>,
    pub input_hash: String,
    pub cache_hit: bool,
    pub duration_s: f64,
    pub timestamp_utc: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub plan_hash: String,
    pub profile: String,
    pub total_seconds: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Canonical order.
    pub results: Vec<NodeResult>,
    pub exit_code: i32,
    /// Nodes never dispatched, in canonical order.
    pub skipped: Vec<String>,
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_report: Option<ProfileSnapshot>,
}

impl ExecutionSummary {
    pub fn failures(&self) -> impl Iterator<Item = &NodeResult> {
        self.results.iter().filter(|result| result.exit_code != 0)
    }
}

/// Everything the scheduler needs besides the plan.
pub struct ExecutionContext<'a> {
    pub repo_root: &'a Path,
    pub workspace_id: &'a str,
    pub cache_root: &'a Path,
    pub runner: &'a dyn NodeRunner,
    pub live: &'a LiveLog,
    pub profiler: &'a Profiler,
    /// Set from outside to stop dispatching and return a partial summary.
    pub cancel: Option<&'a AtomicBool>,
    pub max_workers: usize,
    pub profile_report: bool,
    pub tool_versions: &'a BTreeMap<String, String>,
}

struct Job {
    ctx: RunnerContext,
    input_hash: String,
}

struct Finished {
    node_id: String,
    input_hash: String,
    result: RunnerResult,
    duration_s: f64,
}

/// `sha256(canonical-json({...}))` over every semantic input of a node.
pub fn node_input_hash(
    plan: &ExecutionPlan,
    node: &PlanNode,
    completed: &BTreeMap<String, NodeResult>,
) -> Result<String> {
    let mut deps: Vec<String> = node
        .depends_on
        .iter()
        .map(|dep| {
            let hash = completed
                .get(dep)
                .map(|result| result.output_hash.as_str())
                .unwrap_or("");
            format!("{dep}:{hash}")
        })
        .collect();
    deps.sort();
    canonical_hash(&json!({
        "repo_state_hash": plan.repo_state_hash,
        "plan_profile": plan.profile.as_str(),
        "strict_variant": plan.strict_variant.map(|variant| variant.as_str()),
        "runner_id": node.runner_id,
        "group_id": node.group_id,
        "command": node.command,
        "deps": deps,
    }))
}

fn canonical_key(node: &PlanNode) -> (u32, &str, &str) {
    (node.level, node.runner_id.as_str(), node.node_id.as_str())
}

/// Execute `plan` to completion (or until fail-fast/cancellation).
#[instrument(skip_all, fields(plan_hash = %plan.plan_hash, profile = plan.profile.as_str()))]
pub fn execute_plan(plan: &ExecutionPlan, exec: &ExecutionContext<'_>) -> Result<ExecutionSummary> {
    let started = Instant::now();
    exec.profiler.start_phase("execute", Some(json!({"nodes": plan.nodes.len()})));

    let fail_fast = plan.profile.is_fail_fast();
    let mut pending: Vec<&PlanNode> = plan.nodes.iter().collect();
    pending.sort_by(|a, b| canonical_key(a).cmp(&canonical_key(b)));

    let mut completed: BTreeMap<String, NodeResult> = BTreeMap::new();
    let mut running: BTreeSet<String> = BTreeSet::new();
    let mut cache_hits = 0u64;
    let mut cache_misses = 0u64;
    let mut stop_dispatch = false;
    let mut interrupted = false;

    let workers = exec.max_workers.clamp(1, plan.nodes.len().max(1));
    let (job_tx, job_rx) = mpsc::channel::<Job>();
    let (done_tx, done_rx) = mpsc::channel::<Finished>();
    let job_rx = Mutex::new(job_rx);

    thread::scope(|scope| -> Result<()> {
        for _ in 0..workers {
            let done_tx = done_tx.clone();
            let job_rx = &job_rx;
            scope.spawn(move || worker_loop(job_rx, &done_tx, exec));
        }
        drop(done_tx);
        let mut job_tx = Some(job_tx);

        loop {
            if exec.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) && !stop_dispatch {
                warn!("interrupt received; draining in-flight runners");
                stop_dispatch = true;
                interrupted = true;
            }

            while !stop_dispatch && running.len() < workers {
                let ready: Vec<&PlanNode> = pending
                    .iter()
                    .copied()
                    .filter(|node| node.depends_on.iter().all(|dep| completed.contains_key(dep)))
                    .collect();
                if ready.is_empty() {
                    break;
                }
                for node in ready {
                    if running.len() >= workers {
                        break;
                    }
                    pending.retain(|p| p.node_id != node.node_id);
                    let input_hash = node_input_hash(plan, node, &completed)?;
                    let profile_id = cache_profile_id(&node.runner_id, plan.profile);
                    let tool_version = tool_version_for(&node.runner_id, exec.tool_versions);
                    let cached = tool_version.as_deref().and_then(|tool_version| {
                        load_entry(
                            exec.cache_root,
                            &CacheKey {
                                runner_id: &node.runner_id,
                                input_hash: &input_hash,
                                profile_id: &profile_id,
                                tool_version,
                            },
                        )
                    });
                    if let Some(entry) = cached {
                        cache_hits += 1;
                        let result = node_result_from_cache(node, &input_hash, entry);
                        exec.live.emit(
                            LiveEvent::CacheHit,
                            json!({
                                "runner": node.runner_id,
                                "node": node.node_id,
                                "duration_s": 0.0,
                                "cache_hit": true,
                                "exit_code": result.exit_code,
                            }),
                        );
                        if result.exit_code != 0 && fail_fast {
                            stop_dispatch = true;
                        }
                        completed.insert(node.node_id.clone(), result);
                        if stop_dispatch {
                            break;
                        }
                        continue;
                    }
                    cache_misses += 1;
                    let job = Job {
                        ctx: RunnerContext {
                            repo_root: exec.repo_root.to_path_buf(),
                            workspace_id: exec.workspace_id.to_string(),
                            gate_command: plan.gate_command.clone(),
                            node: node.clone(),
                            plan_profile: plan.profile,
                            repo_state_hash: plan.repo_state_hash.clone(),
                        },
                        input_hash,
                    };
                    debug!(node = %node.node_id, "dispatch");
                    running.insert(node.node_id.clone());
                    if let Some(tx) = &job_tx
                        && tx.send(job).is_err()
                    {
                        anyhow::bail!("worker pool closed before dispatch");
                    }
                }
            }

            if running.is_empty() {
                break;
            }
            let Ok(finished) = done_rx.recv() else {
                anyhow::bail!("worker pool exited with {} runners in flight", running.len());
            };
            running.remove(&finished.node_id);
            let Some(node) = plan.node(&finished.node_id) else {
                continue;
            };
            persist(exec, plan, node, &finished);
            exec.live.emit(
                LiveEvent::CacheMiss,
                json!({
                    "runner": node.runner_id,
                    "node": node.node_id,
                    "duration_s": finished.duration_s,
                    "cache_hit": false,
                    "exit_code": finished.result.exit_code,
                }),
            );
            if finished.result.exit_code != 0 && fail_fast && !stop_dispatch {
                info!(node = %node.node_id, "fail-fast tripped; no further dispatch");
                stop_dispatch = true;
            }
            completed.insert(
                finished.node_id.clone(),
                NodeResult {
                    node_id: node.node_id.clone(),
                    runner_id: node.runner_id.clone(),
                    group_id: node.group_id.clone(),
                    level: node.level,
                    exit_code: finished.result.exit_code,
                    output_hash: finished.result.output_hash,
                    artifacts_produced: finished.result.artifacts_produced,
                    input_hash: finished.input_hash,
                    cache_hit: false,
                    duration_s: finished.duration_s,
                    timestamp_utc: finished.result.timestamp_utc,
                    output: finished.result.output,
                },
            );
        }
        job_tx.take();
        Ok(())
    })?;

    exec.profiler.end_phase("execute", None);

    let mut results: Vec<NodeResult> = completed.into_values().collect();
    results.sort_by(|a, b| {
        (a.level, &a.runner_id, &a.node_id).cmp(&(b.level, &b.runner_id, &b.node_id))
    });
    let skipped: Vec<String> = pending.iter().map(|node| node.node_id.clone()).collect();
    let failed = results.iter().any(|result| result.exit_code != 0);
    let exit_code = i32::from(failed || interrupted);

    let summary = ExecutionSummary {
        plan_hash: plan.plan_hash.clone(),
        profile: plan.profile.as_str().to_string(),
        total_seconds: (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0,
        cache_hits,
        cache_misses,
        results,
        exit_code,
        skipped,
        interrupted,
        profile_report: exec.profile_report.then(|| exec.profiler.snapshot()),
    };
    info!(
        exit_code = summary.exit_code,
        cache_hits,
        cache_misses,
        skipped = summary.skipped.len(),
        "plan executed"
    );
    Ok(summary)
}

fn worker_loop(
    jobs: &Mutex<mpsc::Receiver<Job>>,
    done: &mpsc::Sender<Finished>,
    exec: &ExecutionContext<'_>,
) {
    loop {
        let job = {
            let Ok(receiver) = jobs.lock() else {
                return;
            };
            match receiver.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        let node_id = job.ctx.node.node_id.clone();
        exec.profiler
            .start_phase("runner", Some(json!({"node": node_id})));
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| exec.runner.run(&job.ctx)))
            .unwrap_or_else(|_| {
                never_ran_result(&job.ctx.node, 1, "runner panicked".to_string())
            });
        let duration_s = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
        exec.profiler.end_phase("runner", None);
        let finished = Finished {
            node_id,
            input_hash: job.input_hash,
            result,
            duration_s,
        };
        if done.send(finished).is_err() {
            return;
        }
    }
}

fn persist(
    exec: &ExecutionContext<'_>,
    plan: &ExecutionPlan,
    node: &PlanNode,
    finished: &Finished,
) {
    if finished.result.never_ran {
        debug!(node = %node.node_id, "not caching a runner that never ran");
        return;
    }
    let Some(tool_version) = tool_version_for(&node.runner_id, exec.tool_versions) else {
        return;
    };
    let entry = CacheEntry {
        runner_id: node.runner_id.clone(),
        input_hash: finished.input_hash.clone(),
        profile_id: cache_profile_id(&node.runner_id, plan.profile),
        tool_version,
        output_hash: finished.result.output_hash.clone(),
        exit_code: finished.result.exit_code,
        output: finished.result.output.clone(),
        artifacts_produced: finished.result.artifacts_produced.clone(),
        timestamp_utc: finished.result.timestamp_utc.clone(),
    };
    store_entry(exec.cache_root, &entry);
}

fn node_result_from_cache(node: &PlanNode, input_hash: &str, entry: CacheEntry) -> NodeResult {
    NodeResult {
        node_id: node.node_id.clone(),
        runner_id: node.runner_id.clone(),
        group_id: node.group_id.clone(),
        level: node.level,
        exit_code: entry.exit_code,
        output_hash: entry.output_hash,
        artifacts_produced: entry.artifacts_produced,
        input_hash: input_hash.to_string(),
        cache_hit: true,
        duration_s: 0.0,
        timestamp_utc: entry.timestamp_utc,
        output: entry.output,
    }
}
