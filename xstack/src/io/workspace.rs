//! Workspace resolution: repo root discovery, workspace ids, scoped
//! directories, and the canonical runner environment.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use super::env::{Env, env_value};
use super::git::Git;
use crate::core::canonical::sha256_hex;
use crate::core::refusal::Refusal;

/// Any one of these files marks a build configuration.
pub const BUILD_CONFIG_MARKERS: &[&str] = &["CMakeLists.txt", "Cargo.toml"];

/// Head placeholder when the repo has no VCS.
pub const NO_GIT_HEAD: &str = "nogit";

const WORKSPACE_ID_MAX_LEN: usize = 64;

/// True when `dir` holds a build-configuration file plus `scripts/` and `docs/`.
pub fn is_repo_root(dir: &Path) -> bool {
    BUILD_CONFIG_MARKERS
        .iter()
        .any(|marker| dir.join(marker).is_file())
        && dir.join("scripts").is_dir()
        && dir.join("docs").is_dir()
}

/// Ascend from `cwd`, then from the executable's directory, to the first marked root.
#[instrument(skip_all)]
pub fn resolve_repo_root(cwd: &Path, exe_path: Option<&Path>) -> Result<PathBuf> {
    let mut starts = vec![cwd.to_path_buf()];
    if let Some(exe_dir) = exe_path.and_then(Path::parent) {
        starts.push(exe_dir.to_path_buf());
    }
    for start in &starts {
        for candidate in start.ancestors() {
            if is_repo_root(candidate) {
                debug!(root = %candidate.display(), "repo root resolved");
                return Ok(candidate.to_path_buf());
            }
        }
    }
    Err(Refusal::RepoRootUnresolved(format!(
        "no ancestor of {} has a build config, scripts/, and docs/",
        cwd.display()
    ))
    .into())
}

/// Restrict an override to `[a-z0-9._-]{1,64}`; other characters become `-`.
pub fn sanitize_workspace_id(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches('-');
    trimmed.chars().take(WORKSPACE_ID_MAX_LEN).collect()
}

/// `"ws-" || hex(sha256(repo_root || "|" || head_sha))[0:16]`.
pub fn hashed_workspace_id(repo_root: &str, head_sha: &str) -> String {
    let digest = sha256_hex(format!("{repo_root}|{head_sha}"));
    format!("ws-{}", &digest[..16])
}

/// The `DOM_WS_ID` override when it sanitizes to a non-empty id, else the hash form.
pub fn canonical_workspace_id(repo_root: &Path, env: &Env) -> String {
    if let Some(raw) = env_value(env, "DOM_WS_ID") {
        let sanitized = sanitize_workspace_id(raw);
        if !sanitized.is_empty() {
            return sanitized;
        }
    }
    let head = Git::new(repo_root)
        .head_sha()
        .unwrap_or_else(|_| NO_GIT_HEAD.to_string());
    hashed_workspace_id(&repo_root.display().to_string(), &head)
}

/// Host platform families the orchestrator can canonicalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    pub fn detect(os: &str) -> Result<Self, Refusal> {
        match os {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::Macos),
            "windows" => Ok(Self::Windows),
            other => Err(Refusal::PlatformUnsupported(other.to_string())),
        }
    }

    pub fn current() -> Result<Self, Refusal> {
        Self::detect(std::env::consts::OS)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Macos => "macos",
            Self::Windows => "windows",
        }
    }

    pub fn path_separator(self) -> char {
        match self {
            Self::Windows => ';',
            Self::Linux | Self::Macos => ':',
        }
    }

    pub fn system_path_dirs(self) -> &'static [&'static str] {
        match self {
            Self::Linux => &["/usr/local/bin", "/usr/bin", "/bin"],
            Self::Macos => &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"],
            Self::Windows => &["C:\\Windows\\System32", "C:\\Windows"],
        }
    }
}

/// Workspace-scoped directory roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceDirs {
    pub workspace_id: String,
    pub build_root: PathBuf,
    pub dist_root: PathBuf,
    pub remediation_root: PathBuf,
    pub tools_dir: PathBuf,
}

impl WorkspaceDirs {
    /// Create the three scratch roots. Lookup alone never creates anything.
    pub fn create_all(&self) -> Result<()> {
        for dir in [&self.build_root, &self.dist_root, &self.remediation_root] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Tools directory candidates in probe order.
pub fn tools_dir_candidates(repo_root: &Path, platform: Platform, arch: &str) -> Vec<PathBuf> {
    let bin = repo_root.join("tools").join("bin");
    vec![
        bin.join(format!("{}-{arch}", platform.as_str())),
        bin.join(platform.as_str()),
        bin,
    ]
}

/// Resolve workspace directories without touching the filesystem beyond probing.
pub fn canonical_workspace_dirs(
    repo_root: &Path,
    workspace_id: &str,
    platform: Platform,
    arch: &str,
) -> WorkspaceDirs {
    let candidates = tools_dir_candidates(repo_root, platform, arch);
    let tools_dir = candidates
        .iter()
        .find(|candidate| candidate.is_dir())
        .unwrap_or(&candidates[0])
        .clone();
    WorkspaceDirs {
        workspace_id: workspace_id.to_string(),
        build_root: repo_root.join("out").join("build").join(workspace_id),
        dist_root: repo_root.join("dist").join("ws").join(workspace_id),
        remediation_root: repo_root
            .join("docs")
            .join("audit")
            .join("remediation")
            .join(workspace_id),
        tools_dir,
    }
}

/// Canonical runner environment for the host platform.
pub fn canonicalize_env_for_workspace(
    env: &Env,
    repo_root: &Path,
    workspace_id: &str,
) -> Result<Env> {
    let platform = Platform::current()?;
    Ok(canonicalize_env_for_platform(
        env,
        repo_root,
        workspace_id,
        platform,
        std::env::consts::ARCH,
    ))
}

/// Canonical runner environment: tools dir first, then `DOM_HOST_PATH`
/// entries, then platform system directories, de-duplicated
/// case-insensitively; workspace metadata variables set.
pub fn canonicalize_env_for_platform(
    env: &Env,
    repo_root: &Path,
    workspace_id: &str,
    platform: Platform,
    arch: &str,
) -> Env {
    let dirs = canonical_workspace_dirs(repo_root, workspace_id, platform, arch);
    let separator = platform.path_separator();

    let mut entries: Vec<String> = vec![dirs.tools_dir.display().to_string()];
    if let Some(host) = env_value(env, "DOM_HOST_PATH") {
        entries.extend(
            host.split(separator)
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string),
        );
    }
    entries.extend(platform.system_path_dirs().iter().map(|dir| dir.to_string()));

    let mut seen = std::collections::BTreeSet::new();
    let path: Vec<String> = entries
        .into_iter()
        .filter(|entry| seen.insert(entry.to_ascii_lowercase()))
        .collect();

    let mut canonical = env.clone();
    canonical.insert("PATH".to_string(), path.join(&separator.to_string()));
    canonical.insert("DOM_WS_ID".to_string(), workspace_id.to_string());
    canonical.insert("DOM_REPO_ROOT".to_string(), repo_root.display().to_string());
    canonical.insert(
        "DOM_WS_BUILD_ROOT".to_string(),
        dirs.build_root.display().to_string(),
    );
    canonical.insert(
        "DOM_WS_DIST_ROOT".to_string(),
        dirs.dist_root.display().to_string(),
    );
    canonical.insert(
        "DOM_WS_REMEDIATION_ROOT".to_string(),
        dirs.remediation_root.display().to_string(),
    );
    canonical.insert(
        "DOM_TOOLS_PATH".to_string(),
        dirs.tools_dir.display().to_string(),
    );
    canonical
}
