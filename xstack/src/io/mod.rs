//! Side-effecting operations: filesystem, git, processes, persisted state.

pub mod artifact_contract;
pub mod cache_store;
pub mod config;
pub mod env;
pub mod fs_util;
pub mod git;
pub mod impact;
pub mod ledger;
pub mod live_log;
pub mod merkle;
pub mod process;
pub mod profiler;
pub mod registries;
pub mod runner;
pub mod workspace;
