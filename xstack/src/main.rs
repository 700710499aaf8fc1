//! Incremental gate orchestrator CLI.
//!
//! Gate subcommands (`verify`, `strict`, `full`, `dist`, `snapshot`) plan and
//! execute runners for the current repository state and print the execution
//! summary as JSON. Exit codes: 0 all green, 1 runner failure, 2 refusal.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use xstack::core::canonical::canonical_pretty;
use xstack::core::extensions::tool_version_for;
use xstack::core::refusal::find_refusal;
use xstack::exit_codes;
use xstack::gate::{GateOptions, GateSession, SessionOverrides, plan_gate, run_gate};
use xstack::io::cache_store::{prune_stale_entries, scan_stale_entries};
use xstack::io::env::{Env, capture_process_env};
use xstack::io::ledger::{export_snapshot_markdown, load_entries, render_snapshot_markdown};
use xstack::io::live_log::LiveLog;
use xstack::io::profiler::Profiler;
use xstack::logging;

#[derive(Parser)]
#[command(
    name = "xstack",
    version,
    about = "Deterministic incremental gate orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// FAST gate: impacted FAST groups only; stops dispatching on first failure.
    Verify(GateArgs),
    /// STRICT gate (light or deep depending on what changed).
    Strict(GateArgs),
    /// FULL gate: every admitted group plus heavyweight runners, runs to completion.
    Full(GateArgs),
    /// Distribution gate; FULL unless policy says otherwise.
    Dist(GateArgs),
    /// Inspection run: runner argv forwarded without output routing.
    Snapshot(GateArgs),
    /// Build and print the plan (with per-node explanations) without executing it.
    Plan {
        /// Gate command to plan for.
        #[arg(long, default_value = "verify")]
        gate: String,
        #[command(flatten)]
        args: GateArgs,
    },
    /// Print a markdown snapshot of recorded ledger entries.
    Ledger {
        #[command(flatten)]
        session: SessionArgs,
        /// Maximum entries to include.
        #[arg(long, default_value_t = 20)]
        cap: usize,
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Classify cache entries whose tool version no longer matches.
    CacheScan {
        #[command(flatten)]
        session: SessionArgs,
        /// Delete stale, retired, and unreadable entries.
        #[arg(long)]
        prune: bool,
    },
    /// Print the resolved workspace id and directories.
    Workspace {
        #[command(flatten)]
        session: SessionArgs,
        /// Create the workspace directories.
        #[arg(long)]
        create: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct SessionArgs {
    /// Repository root (otherwise discovered from the working directory).
    #[arg(long)]
    repo_root: Option<PathBuf>,
    /// Workspace id (otherwise `DOM_WS_ID` or derived from repo root and HEAD).
    #[arg(long)]
    workspace_id: Option<String>,
    /// Cache root (default `<repo>/.xstack_cache`).
    #[arg(long)]
    cache_root: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
struct GateArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Restrict the plan to these runner or node ids (repeatable).
    #[arg(long = "only-gate")]
    only_gate: Vec<String>,
    /// Emit live events as JSON lines.
    #[arg(long)]
    trace: bool,
    /// Include the scheduler profile in the summary.
    #[arg(long)]
    profile_report: bool,
    /// Profile override (FAST, STRICT, STRICT-LIGHT, STRICT-DEEP, FULL, FULL_ALL).
    #[arg(long)]
    profile: Option<String>,
}

impl SessionArgs {
    fn overrides(&self) -> SessionOverrides {
        SessionOverrides {
            repo_root: self.repo_root.clone(),
            workspace_id: self.workspace_id.clone(),
            cache_root: self.cache_root.clone(),
        }
    }

    fn resolve(&self, env: &Env) -> Result<GateSession> {
        let cwd = std::env::current_dir().context("read current directory")?;
        let exe = std::env::current_exe().ok();
        GateSession::resolve(&self.overrides(), &cwd, exe.as_deref(), env)
    }
}

impl GateArgs {
    fn options(&self, gate_command: &str) -> GateOptions {
        GateOptions {
            gate_command: gate_command.to_string(),
            profile: self.profile.clone().unwrap_or_default(),
            only_gates: self.only_gate.clone(),
            profile_report: self.profile_report,
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            match find_refusal(&err) {
                Some(refusal) => eprintln!("{}: {err:#}", refusal.code()),
                None => eprintln!("{err:#}"),
            }
            exit_codes::REFUSED
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let env = capture_process_env();
    match cli.command {
        Command::Verify(args) => cmd_gate("verify", &args, &env),
        Command::Strict(args) => cmd_gate("strict", &args, &env),
        Command::Full(args) => cmd_gate("full", &args, &env),
        Command::Dist(args) => cmd_gate("dist", &args, &env),
        Command::Snapshot(args) => cmd_gate("snapshot", &args, &env),
        Command::Plan { gate, args } => cmd_plan(&gate, &args, &env),
        Command::Ledger { session, cap, out } => cmd_ledger(&session, cap, out, &env),
        Command::CacheScan { session, prune } => cmd_cache_scan(&session, prune, &env),
        Command::Workspace { session, create } => cmd_workspace(&session, create, &env),
    }
}

fn cmd_gate(gate_command: &str, args: &GateArgs, env: &Env) -> Result<i32> {
    let session = args.session.resolve(env)?;
    let live = LiveLog::console(args.trace);
    let outcome = run_gate(&session, &args.options(gate_command), env, &live, None, None)?;
    print!("{}", canonical_pretty(&outcome.summary)?);
    Ok(if outcome.summary.exit_code == 0 {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_plan(gate_command: &str, args: &GateArgs, env: &Env) -> Result<i32> {
    let session = args.session.resolve(env)?;
    let plan = plan_gate(&session, &args.options(gate_command), env, &Profiler::new())?;
    print!("{}", canonical_pretty(&plan)?);
    Ok(exit_codes::OK)
}

fn cmd_ledger(session: &SessionArgs, cap: usize, out: Option<PathBuf>, env: &Env) -> Result<i32> {
    let session = session.resolve(env)?;
    let entries = load_entries(&session.cache_root);
    match out {
        Some(path) => export_snapshot_markdown(&entries, cap, &path)?,
        None => print!("{}", render_snapshot_markdown(&entries, cap)),
    }
    Ok(exit_codes::OK)
}

fn cmd_cache_scan(session: &SessionArgs, prune: bool, env: &Env) -> Result<i32> {
    let session = session.resolve(env)?;
    let overrides = session.config.tool_versions.clone();
    let scanned = scan_stale_entries(&session.cache_root, |runner_id| {
        tool_version_for(runner_id, &overrides)
    })?;
    let removed = if prune {
        prune_stale_entries(&scanned)?
    } else {
        0
    };
    let report = json!({
        "cache_root": session.cache_root.display().to_string(),
        "entries": scanned,
        "removable": scanned.iter().filter(|entry| entry.status.is_removable()).count(),
        "removed": removed,
    });
    print!("{}", canonical_pretty(&report)?);
    Ok(exit_codes::OK)
}

fn cmd_workspace(session: &SessionArgs, create: bool, env: &Env) -> Result<i32> {
    let session = session.resolve(env)?;
    let dirs = session.workspace_dirs()?;
    if create {
        dirs.create_all()?;
    }
    let report = json!({
        "workspace_id": session.workspace_id,
        "repo_root": session.repo_root.display().to_string(),
        "cache_root": session.cache_root.display().to_string(),
        "build_root": dirs.build_root.display().to_string(),
        "dist_root": dirs.dist_root.display().to_string(),
        "remediation_root": dirs.remediation_root.display().to_string(),
        "tools_dir": dirs.tools_dir.display().to_string(),
    });
    print!("{}", canonical_pretty(&report)?);
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_verify_flags() {
        let cli = Cli::parse_from([
            "xstack",
            "verify",
            "--workspace-id",
            "ws.alpha",
            "--only-gate",
            "repox_runner",
            "--only-gate",
            "testx.group.core.invariants",
            "--trace",
        ]);
        let Command::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert_eq!(args.session.workspace_id.as_deref(), Some("ws.alpha"));
        assert_eq!(args.only_gate.len(), 2);
        assert!(args.trace);
        assert!(!args.profile_report);
    }

    #[test]
    fn parse_plan_defaults_to_verify() {
        let cli = Cli::parse_from(["xstack", "plan", "--profile", "strict"]);
        let Command::Plan { gate, args } = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(gate, "verify");
        assert_eq!(args.options(&gate).profile, "strict");
    }

    #[test]
    fn parse_cache_scan_prune() {
        let cli = Cli::parse_from(["xstack", "cache-scan", "--prune"]);
        assert!(matches!(cli.command, Command::CacheScan { prune: true, .. }));
    }

    #[test]
    fn parse_ledger_cap() {
        let cli = Cli::parse_from(["xstack", "ledger", "--cap", "5"]);
        assert!(matches!(cli.command, Command::Ledger { cap: 5, .. }));
    }
}
