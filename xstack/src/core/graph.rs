//! Plan DAG construction rules.
//!
//! All functions are deterministic in their inputs: node order is always
//! derived from ids, never from insertion order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::extensions::work_units_for;
use super::refusal::Refusal;
use super::types::{PlanEstimate, PlanNode, Profile};

/// Keep only nodes whose runner id or node id is in `only`; drop dangling edges.
///
/// An empty `only` keeps every node.
pub fn filter_only_gates(nodes: Vec<PlanNode>, only: &[String]) -> Vec<PlanNode> {
    if only.is_empty() {
        return nodes;
    }
    let wanted: BTreeSet<&str> = only.iter().map(String::as_str).collect();
    let mut kept: Vec<PlanNode> = nodes
        .into_iter()
        .filter(|node| {
            wanted.contains(node.runner_id.as_str()) || wanted.contains(node.node_id.as_str())
        })
        .collect();
    let ids: BTreeSet<String> = kept.iter().map(|node| node.node_id.clone()).collect();
    for node in &mut kept {
        node.depends_on.retain(|dep| ids.contains(dep));
    }
    kept
}

/// Chain every group of nodes that declare the same artifact.
///
/// Nodes are scanned in `node_id` order; each claimant of an artifact gains a
/// dependency on the previous claimant, so all writers of one path are
/// totally ordered.
pub fn apply_artifact_write_order(nodes: &mut [PlanNode]) {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|a, b| nodes[*a].node_id.cmp(&nodes[*b].node_id));

    let mut last_writer: BTreeMap<String, String> = BTreeMap::new();
    for index in order {
        let node_id = nodes[index].node_id.clone();
        for artifact in nodes[index].expected_artifacts.clone() {
            if let Some(previous) = last_writer.get(&artifact)
                && previous != &node_id
            {
                nodes[index].depends_on.insert(previous.clone());
            }
            last_writer.insert(artifact, node_id.clone());
        }
    }
}

/// Fill `level = 1 + max(level(dep))`, roots at 0.
///
/// Fails on unknown dependencies, duplicate ids, or cycles.
pub fn assign_levels(nodes: &mut [PlanNode]) -> Result<(), Refusal> {
    let index = index_by_id(nodes)?;
    for node in nodes.iter() {
        for dep in &node.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(Refusal::PlanInputsMalformed(format!(
                    "node '{}' depends on unknown node '{dep}'",
                    node.node_id
                )));
            }
        }
    }

    let mut remaining: BTreeMap<&str, usize> = nodes
        .iter()
        .map(|node| (node.node_id.as_str(), node.depends_on.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for node in nodes.iter() {
        for dep in &node.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(node.node_id.as_str());
        }
    }

    let mut levels: BTreeMap<&str, u32> = BTreeMap::new();
    let mut queue: VecDeque<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    for root in &queue {
        levels.insert(*root, 0);
    }
    while let Some(current) = queue.pop_front() {
        let current_level = levels.get(current).copied().unwrap_or(0);
        for child in dependents.get(current).cloned().unwrap_or_default() {
            let entry = levels.entry(child).or_insert(0);
            *entry = (*entry).max(current_level + 1);
            if let Some(count) = remaining.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if remaining.values().any(|count| *count > 0) {
        let cyclic: Vec<&str> = remaining
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(Refusal::PlanInputsMalformed(format!(
            "dependency cycle among: {}",
            cyclic.join(", ")
        )));
    }

    let resolved: BTreeMap<String, u32> = levels
        .into_iter()
        .map(|(id, level)| (id.to_string(), level))
        .collect();
    for node in nodes.iter_mut() {
        node.level = resolved.get(&node.node_id).copied().unwrap_or(0);
    }
    Ok(())
}

/// Canonical order: level, non-parallelizable first, runner id, node id.
pub fn sort_canonical(nodes: &mut [PlanNode]) {
    nodes.sort_by(|a, b| {
        (a.level, a.parallelizable, &a.runner_id, &a.node_id).cmp(&(
            b.level,
            b.parallelizable,
            &b.runner_id,
            &b.node_id,
        ))
    });
}

/// True when `to` is reachable from `from` by following `depends_on` edges.
pub fn depends_transitively(nodes: &[PlanNode], from: &str, to: &str) -> bool {
    let by_id: BTreeMap<&str, &PlanNode> =
        nodes.iter().map(|node| (node.node_id.as_str(), node)).collect();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        let Some(node) = by_id.get(current) else {
            continue;
        };
        for dep in &node.depends_on {
            if dep == to {
                return true;
            }
            stack.push(dep.as_str());
        }
    }
    false
}

/// Re-check every structural plan invariant.
///
/// Unique ids, existing dependencies, acyclicity, correct levels, and
/// artifact-write-order reachability between every pair of shared writers.
pub fn validate_nodes(nodes: &[PlanNode]) -> Result<(), Refusal> {
    let mut relevelled = nodes.to_vec();
    assign_levels(&mut relevelled)?;
    for (original, recomputed) in nodes.iter().zip(&relevelled) {
        if original.level != recomputed.level {
            return Err(Refusal::PlanInputsMalformed(format!(
                "node '{}' has level {} but topology implies {}",
                original.node_id, original.level, recomputed.level
            )));
        }
    }

    let mut writers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for node in nodes {
        for artifact in &node.expected_artifacts {
            writers
                .entry(artifact.as_str())
                .or_default()
                .push(node.node_id.as_str());
        }
    }
    for (artifact, ids) in writers {
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                if !depends_transitively(nodes, a, b) && !depends_transitively(nodes, b, a) {
                    return Err(Refusal::PlanInputsMalformed(format!(
                        "nodes '{a}' and '{b}' both write '{artifact}' without ordering"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Structural work estimate for a levelled node list.
pub fn estimate(nodes: &[PlanNode], profile: Profile, warn_work_units: u64) -> PlanEstimate {
    let work_units: u64 = nodes.iter().map(|node| work_units_for(&node.runner_id)).sum();
    let mut buckets: BTreeMap<u32, u64> = BTreeMap::new();
    for node in nodes.iter().filter(|node| node.parallelizable) {
        *buckets.entry(node.level).or_default() += 1;
    }
    PlanEstimate {
        node_count: nodes.len() as u64,
        work_units,
        parallel_bucket_max: buckets.values().copied().max().unwrap_or(0),
        warn_full_plan_too_large: profile.is_full_family() && work_units > warn_work_units,
    }
}

fn index_by_id(nodes: &[PlanNode]) -> Result<BTreeMap<&str, usize>, Refusal> {
    let mut index = BTreeMap::new();
    for (position, node) in nodes.iter().enumerate() {
        if index.insert(node.node_id.as_str(), position).is_some() {
            return Err(Refusal::PlanInputsMalformed(format!(
                "duplicate node id '{}'",
                node.node_id
            )));
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, runner: &str, deps: &[&str], artifacts: &[&str], parallel: bool) -> PlanNode {
        PlanNode {
            node_id: id.to_string(),
            runner_id: runner.to_string(),
            group_id: String::new(),
            command: vec!["true".to_string()],
            expected_artifacts: artifacts.iter().map(|a| a.to_string()).collect(),
            parallelizable: parallel,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            level: 0,
        }
    }

    #[test]
    fn shared_artifact_writers_are_chained() {
        let mut nodes = vec![
            node("c", "r", &[], &["out.json"], true),
            node("a", "r", &[], &["out.json"], true),
            node("b", "r", &[], &["out.json"], true),
        ];
        apply_artifact_write_order(&mut nodes);
        assert!(nodes[1].depends_on.is_empty());
        assert_eq!(nodes[2].depends_on, BTreeSet::from(["a".to_string()]));
        assert_eq!(nodes[0].depends_on, BTreeSet::from(["b".to_string()]));
        assign_levels(&mut nodes).expect("levels");
        validate_nodes(&nodes).expect("valid");
    }

    #[test]
    fn levels_follow_longest_path() {
        let mut nodes = vec![
            node("root", "r", &[], &[], false),
            node("mid", "r", &["root"], &[], true),
            node("leaf", "r", &["root", "mid"], &[], true),
        ];
        assign_levels(&mut nodes).expect("levels");
        let levels: Vec<u32> = nodes.iter().map(|n| n.level).collect();
        assert_eq!(levels, vec![0, 1, 2]);
    }

    #[test]
    fn cycles_are_refused() {
        let mut nodes = vec![
            node("a", "r", &["b"], &[], true),
            node("b", "r", &["a"], &[], true),
        ];
        let err = assign_levels(&mut nodes).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn unknown_dependency_is_refused() {
        let mut nodes = vec![node("a", "r", &["ghost"], &[], true)];
        let err = assign_levels(&mut nodes).unwrap_err();
        assert_eq!(err.code(), "refuse.plan_inputs_malformed");
    }

    #[test]
    fn canonical_sort_puts_serial_nodes_first() {
        let mut nodes = vec![
            node("z", "b_runner", &[], &[], true),
            node("y", "a_runner", &[], &[], true),
            node("x", "z_runner", &[], &[], false),
        ];
        sort_canonical(&mut nodes);
        let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[test]
    fn only_gate_filter_drops_dangling_edges() {
        let nodes = vec![
            node("repox.base", "repox_runner", &[], &[], false),
            node("t", "testx.group.a", &["repox.base"], &[], true),
        ];
        let kept = filter_only_gates(nodes, &["testx.group.a".to_string()]);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].depends_on.is_empty());
    }

    #[test]
    fn validation_rejects_unordered_writers() {
        let mut nodes = vec![
            node("a", "r", &[], &["x.json"], true),
            node("b", "r", &[], &["x.json"], true),
        ];
        assign_levels(&mut nodes).expect("levels");
        assert!(validate_nodes(&nodes).is_err());
    }

    #[test]
    fn estimate_counts_work_and_buckets() {
        let mut nodes = vec![
            node("repox.base", "repox_runner", &[], &[], false),
            node("p", "performx_runner", &["repox.base"], &[], true),
            node("s", "securex_runner", &["repox.base"], &[], true),
        ];
        assign_levels(&mut nodes).expect("levels");
        let est = estimate(&nodes, Profile::Full, 8);
        assert_eq!(est.node_count, 3);
        assert_eq!(est.work_units, 9);
        assert_eq!(est.parallel_bucket_max, 2);
        assert!(est.warn_full_plan_too_large);
        assert!(!estimate(&nodes, Profile::Fast, 8).warn_full_plan_too_large);
    }
}
