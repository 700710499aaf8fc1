//! Structured refusals (`refuse.<kind>`).
//!
//! Refusals travel inside `anyhow::Error`; callers that need to choose an exit
//! code recover them with [`find_refusal`].

use thiserror::Error;

/// A structural refusal raised by the resolver, planner, or runner layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("refuse.repo_root_unresolved: {0}")]
    RepoRootUnresolved(String),
    #[error("refuse.platform_unsupported: {0}")]
    PlatformUnsupported(String),
    #[error("refuse.command_unresolvable: {0}")]
    CommandUnresolvable(String),
    #[error("refuse.invalid_runner_command: {0}")]
    InvalidRunnerCommand(String),
    #[error("refuse.bundle_optional_flag")]
    BundleOptionalFlag,
    #[error("refuse.plan_inputs_malformed: {0}")]
    PlanInputsMalformed(String),
}

impl Refusal {
    /// Stable refusal code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RepoRootUnresolved(_) => "refuse.repo_root_unresolved",
            Self::PlatformUnsupported(_) => "refuse.platform_unsupported",
            Self::CommandUnresolvable(_) => "refuse.command_unresolvable",
            Self::InvalidRunnerCommand(_) => "refuse.invalid_runner_command",
            Self::BundleOptionalFlag => "refuse.bundle_optional_flag",
            Self::PlanInputsMalformed(_) => "refuse.plan_inputs_malformed",
        }
    }
}

/// Find the first [`Refusal`] in an error chain.
pub fn find_refusal(err: &anyhow::Error) -> Option<&Refusal> {
    err.chain().find_map(|cause| cause.downcast_ref::<Refusal>())
}
