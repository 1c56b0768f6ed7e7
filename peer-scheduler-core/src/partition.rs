//! C3 — Node Partitioner (leader only).
//!
//! Assigns cluster nodes to scheduler peers so each peer owns a roughly
//! equal share, minimizing churn on membership or inventory change. The
//! algorithm itself (`compute_assignment`) is pure and unit-testable;
//! `NodePartitioner` is the async driver that ticks it against the
//! cluster-API adapters in `cluster.rs`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;

use crate::cluster::{NodeInventorySource, NodeLabeler};
use crate::membership::MembershipView;

/// A node as seen by the partitioner: its name and whatever
/// peer-group label it currently carries (if any).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub current_group: Option<String>,
}

/// How the second pass of `compute_assignment` advances through
/// `short_groups` when a group fills and is removed mid-scan.
///
/// The original design advances a single counter once per move-list
/// entry regardless of removals (`AsSpecified`); §9's open questions
/// flag that this can skip over a still-short group because the index
/// is taken modulo the *pre-removal* length. `Compact` is the corrected
/// alternative, kept behind this enum so both are tested and either can
/// be selected without touching the core loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationPolicy {
    AsSpecified,
    Compact,
}

/// Computes the desired node→group assignment. `groups` is the current
/// list of scheduler peer pod names (relays already excluded by the
/// caller). Returns a full assignment for every node in `nodes`.
pub fn compute_assignment(
    nodes: &[NodeRecord],
    groups: &[String],
    policy: RotationPolicy,
) -> HashMap<String, String> {
    if groups.is_empty() || nodes.is_empty() {
        return HashMap::new();
    }

    let desired = nodes.len().div_ceil(groups.len());
    let group_set: HashSet<&str> = groups.iter().map(String::as_str).collect();

    let mut counts: HashMap<String, usize> = groups.iter().map(|g| (g.clone(), 0)).collect();
    let mut assignment: HashMap<String, String> = HashMap::new();
    let mut move_list: Vec<&NodeRecord> = Vec::new();

    // First pass: keep nodes whose current label is a known group with
    // remaining room. Everything else goes to the move-list.
    for node in nodes {
        let kept = match &node.current_group {
            Some(g) if group_set.contains(g.as_str()) => {
                let count = counts.get_mut(g).expect("group_set matches counts keys");
                if *count < desired {
                    *count += 1;
                    assignment.insert(node.name.clone(), g.clone());
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if !kept {
            move_list.push(node);
        }
    }

    let mut short_groups: Vec<String> = groups
        .iter()
        .filter(|g| counts[*g] < desired)
        .cloned()
        .collect();

    let mut i: usize = 0;
    for node in move_list {
        if short_groups.is_empty() {
            // Every group already holds `desired` nodes; since
            // `desired = ceil(n/g)`, this can only happen if every
            // remaining node was already assigned above.
            break;
        }
        let idx = i % short_groups.len();
        let g = short_groups[idx].clone();
        assignment.insert(node.name.clone(), g.clone());

        let count = counts.get_mut(&g).expect("short_groups drawn from counts keys");
        *count += 1;

        if *count >= desired {
            short_groups.remove(idx);
            if policy == RotationPolicy::Compact {
                // The list shifted left under `idx`; stay put so the
                // next node lands on what is now at `idx`, rather than
                // skipping it the way `AsSpecified` does.
                continue;
            }
        }
        i += 1;
    }

    assignment
}

/// Max group size minus min group size, for the balance property
/// (§8 property 5). Only scheduler groups that appear in `groups` are
/// considered, even if a group ends up with zero nodes.
pub fn balance_spread(assignment: &HashMap<String, String>, groups: &[String]) -> usize {
    if groups.is_empty() {
        return 0;
    }
    let mut counts: HashMap<&str, usize> = groups.iter().map(|g| (g.as_str(), 0)).collect();
    for g in assignment.values() {
        if let Some(c) = counts.get_mut(g.as_str()) {
            *c += 1;
        }
    }
    let max = counts.values().copied().max().unwrap_or(0);
    let min = counts.values().copied().min().unwrap_or(0);
    max - min
}

/// Bounded concurrency for label patches, per the design's "e.g. 1000"
/// budget.
pub const DEFAULT_PATCH_CONCURRENCY: usize = 1000;

/// Async driver: ticks `compute_assignment` against the cluster-API
/// adapters on a timer or on a membership/inventory dirty signal,
/// whichever comes first, and applies the resulting patches with
/// bounded parallelism.
pub struct NodePartitioner {
    inventory: Arc<dyn NodeInventorySource>,
    labeler: Arc<dyn NodeLabeler>,
    policy: RotationPolicy,
    tick_interval: Duration,
    patch_concurrency: usize,
}

impl NodePartitioner {
    pub fn new(
        inventory: Arc<dyn NodeInventorySource>,
        labeler: Arc<dyn NodeLabeler>,
        policy: RotationPolicy,
        tick_interval: Duration,
    ) -> Self {
        Self {
            inventory,
            labeler,
            policy,
            tick_interval,
            patch_concurrency: DEFAULT_PATCH_CONCURRENCY,
        }
    }

    /// One pass: recompute and apply. Returns the number of nodes whose
    /// label was actually patched (i.e. excluding nodes whose label was
    /// already correct).
    pub async fn converge_once(&self, membership: &MembershipView) -> anyhow::Result<usize> {
        let scheduler_groups: Vec<String> = membership
            .members()
            .await
            .into_iter()
            .filter(|e| !e.is_relay())
            .map(|e| e.pod_name)
            .collect();

        if scheduler_groups.is_empty() {
            return Ok(0);
        }

        let nodes = self.inventory.list_nodes().await?;
        let assignment = compute_assignment(&nodes, &scheduler_groups, self.policy);

        let semaphore = Arc::new(Semaphore::new(self.patch_concurrency));
        let mut patched = 0usize;
        let mut handles = Vec::with_capacity(assignment.len());

        for node in &nodes {
            let Some(target_group) = assignment.get(&node.name) else {
                continue;
            };
            if node.current_group.as_deref() == Some(target_group.as_str()) {
                continue;
            }
            patched += 1;

            let labeler = self.labeler.clone();
            let semaphore = semaphore.clone();
            let node_name = node.name.clone();
            let target_group = target_group.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                labeler.set_group_label(&node_name, &target_group).await
            }));
        }

        for handle in handles {
            handle.await??;
        }

        Ok(patched)
    }

    /// Runs until `shutdown` resolves: wakes on every tick of
    /// `tick_interval`, or promptly whenever membership changes,
    /// whichever comes first (the dirty-flag/tick pattern from §4.3).
    pub async fn run(
        self: Arc<Self>,
        membership: Arc<MembershipView>,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        let mut membership_changes = membership.subscribe();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = membership_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }

            if let Err(err) = self.converge_once(&membership).await {
                tracing::warn!(error = %err, "node partitioner convergence failed");
            }
        }
    }
}
