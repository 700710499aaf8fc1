//! Orchestrator configuration stored under `.xstack/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::env::{Env, env_value};

/// Config file location relative to the repo root.
pub const CONFIG_REL_PATH: &str = ".xstack/config.toml";

/// Upper bound for the worker pool.
pub const MAX_WORKERS_CAP: usize = 16;

/// Orchestrator configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults
/// below. Environment variables override the file where both exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct XStackConfig {
    /// Cache root, relative to the repo root unless absolute.
    pub cache_dir: String,

    /// Baseline ref for diff-based change detection.
    pub baseline_ref: String,

    /// Worker pool cap; `None` means host CPU count.
    pub max_workers: Option<usize>,

    /// Replaces a leading `python`/`python3` runner token.
    pub interpreter: String,

    /// Bytes of runner output kept in memory per invocation.
    pub output_limit_bytes: usize,

    /// FULL plans above this many work units raise `warn_full_plan_too_large`.
    pub warn_full_plan_work_units: u64,

    pub registries: RegistryPaths,

    /// Per-runner tool version overrides.
    pub tool_versions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryPaths {
    pub derived_artifacts: String,
    pub testx_groups: String,
    pub auditx_groups: String,
    pub components: String,
    pub gate_policy: String,
}

impl Default for RegistryPaths {
    fn default() -> Self {
        Self {
            derived_artifacts: "data/registries/derived_artifacts.json".to_string(),
            testx_groups: "data/registries/testx_groups.json".to_string(),
            auditx_groups: "data/registries/auditx_groups.json".to_string(),
            components: "data/registries/xstack_components.json".to_string(),
            gate_policy: "data/registries/gate_policy.json".to_string(),
        }
    }
}

impl Default for XStackConfig {
    fn default() -> Self {
        Self {
            cache_dir: ".xstack_cache".to_string(),
            baseline_ref: "origin/main".to_string(),
            max_workers: None,
            interpreter: "python3".to_string(),
            output_limit_bytes: 4 * 1024 * 1024,
            warn_full_plan_work_units: 64,
            registries: RegistryPaths::default(),
            tool_versions: BTreeMap::new(),
        }
    }
}

impl XStackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.trim().is_empty() {
            return Err(anyhow!("cache_dir must be non-empty"));
        }
        if self.baseline_ref.trim().is_empty() {
            return Err(anyhow!("baseline_ref must be non-empty"));
        }
        if self.interpreter.trim().is_empty() {
            return Err(anyhow!("interpreter must be non-empty"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.warn_full_plan_work_units == 0 {
            return Err(anyhow!("warn_full_plan_work_units must be > 0"));
        }
        for (runner, version) in &self.tool_versions {
            if version.trim().is_empty() {
                return Err(anyhow!("tool_versions.{runner} must be non-empty"));
            }
        }
        Ok(())
    }

    /// Absolute cache root for `repo_root`.
    pub fn cache_root(&self, repo_root: &Path) -> PathBuf {
        let configured = Path::new(&self.cache_dir);
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            repo_root.join(configured)
        }
    }

    /// Baseline ref, with `DOM_BASELINE_REF` taking precedence.
    pub fn baseline_ref(&self, env: &Env) -> String {
        env_value(env, "DOM_BASELINE_REF")
            .map(str::to_string)
            .unwrap_or_else(|| self.baseline_ref.clone())
    }

    /// Worker count: `DOM_GATE_MAX_WORKERS`, then config, then CPU count; clamped to 1..=16.
    ///
    /// A zero or unparseable override falls back to the CPU count.
    pub fn max_workers(&self, env: &Env, cpu_count: usize) -> usize {
        let requested = env_value(env, "DOM_GATE_MAX_WORKERS")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .or(self.max_workers)
            .filter(|count| *count > 0)
            .unwrap_or(cpu_count);
        requested.clamp(1, MAX_WORKERS_CAP)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `XStackConfig::default()`.
pub fn load_config(path: &Path) -> Result<XStackConfig> {
    if !path.exists() {
        let cfg = XStackConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: XStackConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Load `<repo_root>/.xstack/config.toml`.
pub fn load_repo_config(repo_root: &Path) -> Result<XStackConfig> {
    load_config(&repo_root.join(CONFIG_REL_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, XStackConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_workers = 3\n[tool_versions]\nrepox_runner = \"repox-9\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_workers, Some(3));
        assert_eq!(cfg.tool_versions["repox_runner"], "repox-9");
        assert_eq!(cfg.baseline_ref, "origin/main");
        assert_eq!(cfg.registries, RegistryPaths::default());
    }

    #[test]
    fn rejects_blank_tool_version() {
        let mut cfg = XStackConfig::default();
        cfg.tool_versions
            .insert("testx_runner".to_string(), " ".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_override_is_clamped() {
        let cfg = XStackConfig::default();
        let mut env = Env::new();
        env.insert("DOM_GATE_MAX_WORKERS".to_string(), "0".to_string());
        assert_eq!(cfg.max_workers(&env, 8), 8);
        assert_eq!(cfg.max_workers(&env, 64), 16);
        env.insert("DOM_GATE_MAX_WORKERS".to_string(), "3".to_string());
        assert_eq!(cfg.max_workers(&env, 8), 3);
        env.insert("DOM_GATE_MAX_WORKERS".to_string(), "99".to_string());
        assert_eq!(cfg.max_workers(&env, 8), 16);
        env.insert("DOM_GATE_MAX_WORKERS".to_string(), "many".to_string());
        assert_eq!(cfg.max_workers(&env, 0), 1);
    }

    #[test]
    fn env_overrides_baseline_ref() {
        let cfg = XStackConfig::default();
        let mut env = Env::new();
        assert_eq!(cfg.baseline_ref(&env), "origin/main");
        env.insert("DOM_BASELINE_REF".to_string(), "origin/release".to_string());
        assert_eq!(cfg.baseline_ref(&env), "origin/release");
    }
}
