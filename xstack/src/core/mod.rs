//! Deterministic, pure logic shared by the orchestrator core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod canonical;
pub mod extensions;
pub mod graph;
pub mod impact;
pub mod paths;
pub mod profile;
pub mod refusal;
pub mod routing;
pub mod types;
