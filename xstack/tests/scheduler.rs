//! Scheduler tests driven by a scripted runner.
//!
//! Plans are built by hand so each test controls topology, levels, and
//! which nodes fail, then executed against a scratch cache root.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use xstack::core::types::{ExecutionPlan, Profile, RunnerResult};
use xstack::io::live_log::LiveLog;
use xstack::io::profiler::Profiler;
use xstack::io::runner::{NodeRunner, RunnerContext, normalize_result};
use xstack::scheduler::{ExecutionContext, ExecutionSummary, execute_plan};
use xstack::test_support::{ScriptedRunner, SharedBuffer, node, plan_from_nodes, writer};

fn run(
    plan: &ExecutionPlan,
    cache_root: &Path,
    runner: &dyn NodeRunner,
    max_workers: usize,
    cancel: Option<&AtomicBool>,
) -> ExecutionSummary {
    let live = LiveLog::silent();
    let profiler = Profiler::new();
    let tool_versions = BTreeMap::new();
    let exec = ExecutionContext {
        repo_root: cache_root,
        workspace_id: "ws.test",
        cache_root,
        runner,
        live: &live,
        profiler: &profiler,
        cancel,
        max_workers,
        profile_report: false,
        tool_versions: &tool_versions,
    };
    execute_plan(plan, &exec).expect("execute plan")
}

/// Base at level 0 plus three level-1 siblings; `testx.group.b` sorts first.
fn four_node_plan(profile: Profile) -> ExecutionPlan {
    plan_from_nodes(
        profile,
        vec![
            node("repox.base", "repox_runner", &[], false),
            node("testx.group.b", "testx.group.b", &["repox.base"], true),
            node("testx.group.c", "testx.group.c", &["repox.base"], true),
            node("testx.group.d", "testx.group.d", &["repox.base"], true),
        ],
    )
}

fn ids(summary: &ExecutionSummary) -> Vec<&str> {
    summary.results.iter().map(|r| r.node_id.as_str()).collect()
}

#[test]
fn fail_fast_stops_dispatch_after_first_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Fast);
    let runner = ScriptedRunner::new().exit("testx.group.b", 3);

    let summary = run(&plan, temp.path(), &runner, 1, None);

    assert_eq!(runner.calls(), vec!["repox.base", "testx.group.b"]);
    assert_eq!(ids(&summary), vec!["repox.base", "testx.group.b"]);
    assert_eq!(summary.skipped, vec!["testx.group.c", "testx.group.d"]);
    assert_eq!(summary.exit_code, 1);
    assert!(!summary.interrupted);
    assert_eq!(summary.failures().count(), 1);
}

#[test]
fn full_profile_runs_every_node_despite_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Full);
    let runner = ScriptedRunner::new().exit("testx.group.b", 3);

    let summary = run(&plan, temp.path(), &runner, 2, None);

    assert_eq!(runner.calls().len(), 4);
    assert_eq!(
        ids(&summary),
        vec!["repox.base", "testx.group.b", "testx.group.c", "testx.group.d"]
    );
    assert!(summary.skipped.is_empty());
    assert_eq!(summary.exit_code, 1);
}

#[test]
fn dependents_wait_for_their_dependencies() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Full);
    let runner = ScriptedRunner::new().delay("repox.base", Duration::from_millis(50));

    let summary = run(&plan, temp.path(), &runner, 4, None);

    assert_eq!(runner.calls()[0], "repox.base");
    assert_eq!(summary.exit_code, 0);
    assert!(summary.results.iter().skip(1).all(|r| r.level == 1));
}

#[test]
fn results_follow_canonical_order_not_completion_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Full);
    let runner = ScriptedRunner::new()
        .delay("testx.group.b", Duration::from_millis(80))
        .delay("testx.group.c", Duration::from_millis(40));

    let summary = run(&plan, temp.path(), &runner, 4, None);

    assert_eq!(
        ids(&summary),
        vec!["repox.base", "testx.group.b", "testx.group.c", "testx.group.d"]
    );
}

#[test]
fn second_run_is_served_from_cache() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Fast);

    let first_runner = ScriptedRunner::new();
    let first = run(&plan, temp.path(), &first_runner, 2, None);
    assert_eq!(first.cache_misses, 4);
    assert_eq!(first.cache_hits, 0);

    let second_runner = ScriptedRunner::new();
    let second = run(&plan, temp.path(), &second_runner, 2, None);
    assert!(second_runner.calls().is_empty());
    assert_eq!(second.cache_hits, 4);
    assert_eq!(second.cache_misses, 0);
    assert!(second.results.iter().all(|r| r.cache_hit));

    let first_hashes: Vec<&str> = first.results.iter().map(|r| r.output_hash.as_str()).collect();
    let second_hashes: Vec<&str> = second.results.iter().map(|r| r.output_hash.as_str()).collect();
    assert_eq!(first_hashes, second_hashes);
}

#[test]
fn cache_is_not_shared_across_profiles_for_group_runners() {
    let temp = tempfile::tempdir().expect("tempdir");
    run(&four_node_plan(Profile::Fast), temp.path(), &ScriptedRunner::new(), 2, None);

    let runner = ScriptedRunner::new();
    let summary = run(&four_node_plan(Profile::Full), temp.path(), &runner, 2, None);
    assert_eq!(summary.cache_hits, 0);
    assert_eq!(runner.calls().len(), 4);
}

#[test]
fn preset_interrupt_dispatches_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Full);
    let runner = ScriptedRunner::new();
    let cancel = AtomicBool::new(true);

    let summary = run(&plan, temp.path(), &runner, 2, Some(&cancel));

    assert!(runner.calls().is_empty());
    assert!(summary.interrupted);
    assert_eq!(summary.exit_code, 1);
    assert_eq!(summary.skipped.len(), 4);
}

struct InterruptingRunner<'a> {
    flag: &'a AtomicBool,
}

impl NodeRunner for InterruptingRunner<'_> {
    fn run(&self, ctx: &RunnerContext) -> RunnerResult {
        self.flag.store(true, Ordering::SeqCst);
        normalize_result(&ctx.node, 0, String::new())
    }
}

#[test]
fn interrupt_drains_in_flight_work_and_returns_partial_summary() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Full);
    let cancel = AtomicBool::new(false);
    let runner = InterruptingRunner { flag: &cancel };

    let summary = run(&plan, temp.path(), &runner, 2, Some(&cancel));

    assert_eq!(ids(&summary), vec!["repox.base"]);
    assert!(summary.interrupted);
    assert_eq!(summary.skipped.len(), 3);
    assert_eq!(summary.exit_code, 1);
}

#[test]
fn runner_panic_is_recorded_as_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Full);
    let runner = ScriptedRunner::new().panic_on("testx.group.c");

    let summary = run(&plan, temp.path(), &runner, 2, None);

    let failed: Vec<&str> = summary.failures().map(|r| r.node_id.as_str()).collect();
    assert_eq!(failed, vec!["testx.group.c"]);
    assert_eq!(summary.results.len(), 4);
    assert_eq!(summary.exit_code, 1);
}

#[test]
fn panicked_node_is_rerun_on_the_next_invocation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Full);
    let panicking = ScriptedRunner::new().panic_on("testx.group.c");
    let first = run(&plan, temp.path(), &panicking, 2, None);
    assert_eq!(first.exit_code, 1);

    let runner = ScriptedRunner::new();
    let second = run(&plan, temp.path(), &runner, 2, None);

    assert_eq!(runner.calls(), vec!["testx.group.c"]);
    assert_eq!(second.cache_hits, 3);
    assert_eq!(second.cache_misses, 1);
    assert_eq!(second.exit_code, 0);
}

#[test]
fn artifact_writers_never_overlap() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = plan_from_nodes(
        Profile::Full,
        vec![
            node("repox.base", "repox_runner", &[], false),
            writer("testx.group.a", "testx.group.a", &["repox.base"], &["docs/audit/shared.json"]),
            writer("testx.group.b", "testx.group.b", &["repox.base"], &["docs/audit/shared.json"]),
        ],
    );
    let second = plan.node("testx.group.b").expect("writer b");
    assert!(second.depends_on.contains("testx.group.a"));
    assert_eq!(second.level, 2);

    let runner = ScriptedRunner::new().delay("testx.group.a", Duration::from_millis(40));
    let summary = run(&plan, temp.path(), &runner, 4, None);
    assert_eq!(runner.calls(), vec!["repox.base", "testx.group.a", "testx.group.b"]);
    assert_eq!(summary.exit_code, 0);
}

#[test]
fn live_log_reports_cache_misses_then_hits() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = four_node_plan(Profile::Fast);
    let buffer = SharedBuffer::default();
    let live = LiveLog::with_sink(true, Box::new(buffer.clone()));
    let profiler = Profiler::new();
    let tool_versions = BTreeMap::new();
    let runner = ScriptedRunner::new();
    let exec = ExecutionContext {
        repo_root: temp.path(),
        workspace_id: "ws.test",
        cache_root: temp.path(),
        runner: &runner,
        live: &live,
        profiler: &profiler,
        cancel: None,
        max_workers: 1,
        profile_report: true,
        tool_versions: &tool_versions,
    };

    let first = execute_plan(&plan, &exec).expect("first");
    execute_plan(&plan, &exec).expect("second");

    let text = buffer.text();
    let events: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().expect("event")).collect();
    assert_eq!(kinds.iter().filter(|k| **k == "cache_miss").count(), 4);
    assert_eq!(kinds.iter().filter(|k| **k == "cache_hit").count(), 4);
    assert_eq!(events[0]["node"], "repox.base");

    let report = first.profile_report.expect("profile report");
    assert!(report.cumulative.iter().any(|rollup| rollup.phase == "runner"));
}
