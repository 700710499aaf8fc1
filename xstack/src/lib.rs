//! Incremental gate orchestrator.
//!
//! Decides which verification runners must execute for a repository state,
//! runs them in parallel under dependency and artifact-write-order
//! constraints, caches their results by content, and records every run in an
//! append-only ledger. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (canonical JSON, profiles, plan
//!   graph, impact matching, output routing). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   caches, ledger). Runner execution sits behind the
//!   [`io::runner::NodeRunner`] trait so tests can script outcomes.
//!
//! Orchestration modules ([`plan`], [`scheduler`], [`gate`]) coordinate core
//! logic with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod plan;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
