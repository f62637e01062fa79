//! Node filtering and ranking.

use std::cmp::Ordering;

use crate::models::{Job, NodeInfo, Resources, Task};

/// Weight of the available-capacity term in a node's score.
const AVAILABLE_WEIGHT: f64 = 30.0;

/// Weight of the idle-queue term in a node's score.
const QUEUE_WEIGHT: f64 = 15.0;

/// Why `node` can never host `job`, independent of its current load.
pub fn ineligibility(node: &NodeInfo, job: &Job, task: &Task) -> Option<String> {
    if !node.is_connected() {
        return Some("node is disconnected".to_string());
    }
    if let Some(constraint) = job.constraints.iter().find(|c| !c.matches(&node.labels)) {
        return Some(format!("constraint on '{}' not met", constraint.key));
    }
    node.missing_capability(task)
        .map(|capability| format!("node lacks {capability}"))
}

/// Whether `required` fits into the node's oversubscribed headroom: total
/// capacity times `factor`, minus what is in use, minus what is queued.
pub fn has_capacity(node: &NodeInfo, required: &Resources, factor: f64) -> bool {
    let in_use = node.total_capacity.saturating_sub(&node.available_capacity);
    let headroom = node
        .total_capacity
        .scaled(factor)
        .saturating_sub(&in_use)
        .saturating_sub(&node.queue_used_capacity);
    required.fits_within(&headroom)
}

fn ratio(part: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (part / total).clamp(0.0, 1.0)
}

/// Placement score of `node` for a task needing `required`. Higher is better.
///
/// Each resource dimension contributes `available/total * 30` plus
/// `(1 - queued/total) * 15`, weighted by how much of the node the task would
/// take in that dimension. Without any request the offered dimensions weigh
/// equally.
pub fn score(node: &NodeInfo, required: &Resources) -> f64 {
    let total = &node.total_capacity;
    let available = &node.available_capacity;
    let queued = &node.queue_used_capacity;
    let dims = [
        (required.cpu, total.cpu, available.cpu, queued.cpu),
        (
            required.memory as f64,
            total.memory as f64,
            available.memory as f64,
            queued.memory as f64,
        ),
        (
            required.disk as f64,
            total.disk as f64,
            available.disk as f64,
            queued.disk as f64,
        ),
        (
            required.gpu as f64,
            total.gpu as f64,
            available.gpu as f64,
            queued.gpu as f64,
        ),
    ];

    let offered: Vec<_> = dims.iter().filter(|d| d.1 > 0.0).collect();
    if offered.is_empty() {
        return 0.0;
    }
    let mut weights: Vec<f64> = offered.iter().map(|d| ratio(d.0, d.1)).collect();
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        weights = vec![1.0; offered.len()];
    }
    let sum: f64 = weights.iter().sum();

    offered
        .iter()
        .zip(weights)
        .map(|((_, total, available, queued), weight)| {
            let dim = ratio(*available, *total) * AVAILABLE_WEIGHT
                + (1.0 - ratio(*queued, *total)) * QUEUE_WEIGHT;
            dim * weight / sum
        })
        .sum()
}

/// Orders nodes best first. Equal scores are ordered by node ID.
pub fn rank_nodes<'a>(nodes: Vec<&'a NodeInfo>, required: &Resources) -> Vec<&'a NodeInfo> {
    let mut scored: Vec<(f64, &NodeInfo)> = nodes.into_iter().map(|n| (score(n, required), n)).collect();
    scored.sort_by(|a, b| match b.0.total_cmp(&a.0) {
        Ordering::Equal => a.1.id.cmp(&b.1.id),
        other => other,
    });
    scored.into_iter().map(|(_, n)| n).collect()
}
