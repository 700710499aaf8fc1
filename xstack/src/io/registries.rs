//! Group, component, and gate-policy registries.
//!
//! A missing registry is empty; a present but malformed one is refused with
//! `refuse.plan_inputs_malformed`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::refusal::Refusal;
use crate::core::types::{ComponentSpec, GroupSpec};
use crate::io::config::RegistryPaths;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registries {
    pub testx_groups: Vec<GroupSpec>,
    pub auditx_groups: Vec<GroupSpec>,
    pub components: Vec<ComponentSpec>,
    /// `gate_command → profile` from the gate policy.
    pub default_mode_by_command: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    record: T,
}

#[derive(Debug, Default, Deserialize)]
struct GroupsRecord {
    #[serde(default)]
    groups: Vec<GroupSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct ComponentsRecord {
    #[serde(default)]
    components: Vec<ComponentSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyRecord {
    #[serde(default)]
    extensions: PolicyExtensions,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyExtensions {
    #[serde(default)]
    default_mode_by_command: BTreeMap<String, String>,
}

/// Load every registry named in `paths`.
pub fn load_registries(repo_root: &Path, paths: &RegistryPaths) -> Result<Registries> {
    let registries = Registries {
        testx_groups: load_groups(&repo_root.join(&paths.testx_groups))?,
        auditx_groups: load_groups(&repo_root.join(&paths.auditx_groups))?,
        components: load_components(&repo_root.join(&paths.components))?,
        default_mode_by_command: load_gate_policy(&repo_root.join(&paths.gate_policy))?,
    };
    debug!(
        testx = registries.testx_groups.len(),
        auditx = registries.auditx_groups.len(),
        components = registries.components.len(),
        "registries loaded"
    );
    Ok(registries)
}

/// Groups sorted by `group_id`; ids must be non-empty and unique.
pub fn load_groups(path: &Path) -> Result<Vec<GroupSpec>> {
    let Some(record) = read_record::<GroupsRecord>(path)? else {
        return Ok(Vec::new());
    };
    let mut seen = BTreeSet::new();
    let mut groups = Vec::with_capacity(record.groups.len());
    for mut group in record.groups {
        group.group_id = group.group_id.trim().to_string();
        if group.group_id.is_empty() {
            return Err(malformed(path, "group with empty group_id"));
        }
        if !seen.insert(group.group_id.clone()) {
            return Err(malformed(
                path,
                &format!("duplicate group_id {}", group.group_id),
            ));
        }
        groups.push(group);
    }
    groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    Ok(groups)
}

/// Components sorted by `component_id`.
pub fn load_components(path: &Path) -> Result<Vec<ComponentSpec>> {
    let Some(record) = read_record::<ComponentsRecord>(path)? else {
        return Ok(Vec::new());
    };
    let mut components = record.components;
    if components.iter().any(|c| c.component_id.trim().is_empty()) {
        return Err(malformed(path, "component with empty component_id"));
    }
    components.sort_by(|a, b| a.component_id.cmp(&b.component_id));
    Ok(components)
}

/// `gate_command → profile` with commands lowercased and profiles uppercased.
pub fn load_gate_policy(path: &Path) -> Result<BTreeMap<String, String>> {
    let Some(record) = read_record::<PolicyRecord>(path)? else {
        return Ok(BTreeMap::new());
    };
    Ok(record
        .extensions
        .default_mode_by_command
        .into_iter()
        .map(|(command, mode)| {
            (
                command.trim().to_ascii_lowercase(),
                mode.trim().to_ascii_uppercase(),
            )
        })
        .filter(|(command, mode)| !command.is_empty() && !mode.is_empty())
        .collect())
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        debug!(path = %path.display(), "registry missing; treating as empty");
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|err| malformed(path, &err.to_string()))?;
    let envelope: Envelope<T> =
        serde_json::from_str(&contents).map_err(|err| malformed(path, &err.to_string()))?;
    Ok(Some(envelope.record))
}

fn malformed(path: &Path, detail: &str) -> anyhow::Error {
    Refusal::PlanInputsMalformed(format!("{}: {detail}", path.display())).into()
}
