//! C1 — Membership View.
//!
//! Maintains the live set of peer endpoints, derived from an external
//! endpoint-discovery stream (modeled here as updates keyed by
//! `EndpointSlice` name, matching how Kubernetes actually shards large
//! services across multiple slice objects). Readers always see a
//! consistent snapshot; the mutation path is a single `RwLock` write
//! guarded by a per-slice generation counter so redundant re-deliveries
//! are ignored.

use std::collections::HashMap;

use tokio::sync::{watch, RwLock};

use crate::hashing::fnv1a_32;
use crate::types::{Endpoint, PodKey};

/// A point-in-time view of the cluster's peer set.
#[derive(Clone, Debug, Default)]
pub struct MembershipSnapshot {
    pub endpoints: Vec<Endpoint>,
    pub leader: Option<String>,
}

impl MembershipSnapshot {
    /// Leader first (if present in the set), then relays lexicographic,
    /// then schedulers lexicographic. Every peer must compute this the
    /// same way — it underpins `target_for_scoring` and the relay tree
    /// layout (C2).
    pub fn sorted(&self) -> Vec<Endpoint> {
        let mut leader_ep = None;
        let mut relays = Vec::new();
        let mut schedulers = Vec::new();

        for e in &self.endpoints {
            if self.leader.as_deref() == Some(e.pod_name.as_str()) {
                leader_ep = Some(e);
                continue;
            }
            if e.is_relay() {
                relays.push(e);
            } else {
                schedulers.push(e);
            }
        }
        relays.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
        schedulers.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));

        let mut out = Vec::with_capacity(self.endpoints.len());
        out.extend(leader_ep.cloned());
        out.extend(relays.into_iter().cloned());
        out.extend(schedulers.into_iter().cloned());
        out
    }
}

struct SliceRecord {
    generation: u64,
    pod_names: Vec<String>,
}

#[derive(Default)]
struct Inner {
    slices: HashMap<String, SliceRecord>,
    endpoints: HashMap<String, Endpoint>,
    leader: Option<String>,
}

pub struct MembershipView {
    self_endpoint: Endpoint,
    allow_solo: bool,
    inner: RwLock<Inner>,
    dirty_tx: watch::Sender<u64>,
}

impl MembershipView {
    pub fn new(self_endpoint: Endpoint, allow_solo: bool) -> Self {
        let (dirty_tx, _) = watch::channel(0);
        Self {
            self_endpoint,
            allow_solo,
            inner: RwLock::new(Inner::default()),
            dirty_tx,
        }
    }

    /// Subscribe to structural changes (membership or leader). C2 and C3
    /// poll this to know when their cached derivations go stale.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.dirty_tx.subscribe()
    }

    /// Ingest an add/update for one endpoint-slice. Ignored if
    /// `generation` matches what's already recorded for this slice
    /// (redundant re-delivery).
    pub async fn apply_slice_update(
        &self,
        slice_name: String,
        generation: u64,
        endpoints: Vec<Endpoint>,
    ) {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.slices.get(&slice_name) {
            if existing.generation == generation {
                return;
            }
        }

        if let Some(old) = inner.slices.remove(&slice_name) {
            for pod_name in &old.pod_names {
                inner.endpoints.remove(pod_name);
            }
        }

        let pod_names = endpoints.iter().map(|e| e.pod_name.clone()).collect();
        for e in endpoints {
            inner.endpoints.insert(e.pod_name.clone(), e);
        }
        inner.slices.insert(
            slice_name,
            SliceRecord {
                generation,
                pod_names,
            },
        );

        self.bump();
    }

    pub async fn apply_slice_delete(&self, slice_name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.slices.remove(slice_name) {
            for pod_name in &old.pod_names {
                inner.endpoints.remove(pod_name);
            }
            self.bump();
        }
    }

    /// Externally driven (leader-election callback). Marks membership
    /// dirty so C2 recomputes the relay tree — two peers at the same
    /// sort index disagree on sub-members if they disagree on the
    /// leader, so this must never be cached across a leader change.
    pub async fn set_leader(&self, leader: Option<String>) {
        let mut inner = self.inner.write().await;
        if inner.leader != leader {
            inner.leader = leader;
            self.bump();
        }
    }

    pub async fn snapshot(&self) -> MembershipSnapshot {
        let inner = self.inner.read().await;
        MembershipSnapshot {
            endpoints: inner.endpoints.values().cloned().collect(),
            leader: inner.leader.clone(),
        }
    }

    pub async fn member_count(&self) -> usize {
        let n = self.inner.read().await.endpoints.len();
        if n == 0 && self.allow_solo {
            1
        } else {
            n
        }
    }

    pub async fn member_count_no_relays(&self) -> usize {
        let n = {
            let inner = self.inner.read().await;
            inner.endpoints.values().filter(|e| !e.is_relay()).count()
        };
        if n == 0 && self.allow_solo {
            1
        } else {
            n
        }
    }

    /// Sorted endpoint list. In solo mode an empty cluster is replaced
    /// by a single synthetic self-entry so the pipeline still runs
    /// end-to-end with zero peers.
    pub async fn members(&self) -> Vec<Endpoint> {
        let sorted = self.snapshot().await.sorted();
        if sorted.is_empty() && self.allow_solo {
            vec![self.self_endpoint.clone()]
        } else {
            sorted
        }
    }

    /// The endpoint responsible for aggregating scores for `key`. With
    /// a single member this is that member directly, no hash involved.
    pub async fn target_for_scoring(&self, key: &PodKey) -> Option<Endpoint> {
        let members = self.members().await;
        match members.len() {
            0 => None,
            1 => Some(members.into_iter().next().unwrap()),
            n => {
                let idx = (fnv1a_32(key.as_str()) as usize) % n;
                Some(members[idx].clone())
            }
        }
    }

    fn bump(&self) {
        let next = self.dirty_tx.borrow().wrapping_add(1);
        let _ = self.dirty_tx.send(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(name: &str) -> Endpoint {
        Endpoint::new(name, vec![format!("10.0.0.{name}")])
    }

    #[tokio::test]
    async fn solo_mode_synthesizes_self_entry() {
        let view = MembershipView::new(Endpoint::new("self", vec!["127.0.0.1".into()]), true);
        assert_eq!(view.member_count().await, 1);
        assert_eq!(view.members().await, vec![Endpoint::new("self", vec!["127.0.0.1".into()])]);
    }

    #[tokio::test]
    async fn non_solo_empty_membership_is_zero() {
        let view = MembershipView::new(Endpoint::new("self", vec!["127.0.0.1".into()]), false);
        assert_eq!(view.member_count().await, 0);
        assert!(view.members().await.is_empty());
    }

    #[tokio::test]
    async fn redundant_generation_is_ignored() {
        let view = MembershipView::new(Endpoint::new("self", vec![]), false);
        view.apply_slice_update("slice-a".into(), 1, vec![ep("scheduler-0")])
            .await;
        let before = *view.subscribe().borrow();
        view.apply_slice_update("slice-a".into(), 1, vec![ep("scheduler-0")])
            .await;
        let after = *view.subscribe().borrow();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn sort_order_is_leader_then_relays_then_schedulers() {
        let view = MembershipView::new(Endpoint::new("self", vec![]), false);
        view.apply_slice_update(
            "slice-a".into(),
            1,
            vec![
                ep("scheduler-b"),
                ep("scheduler-a"),
                Endpoint::new("relay-b", vec![]),
                Endpoint::new("relay-a", vec![]),
            ],
        )
        .await;
        view.set_leader(Some("scheduler-b".into())).await;

        let members = view.members().await;
        let names: Vec<&str> = members.iter().map(|e| e.pod_name.as_str()).collect();
        assert_eq!(names, vec!["scheduler-b", "relay-a", "relay-b", "scheduler-a"]);
    }

    #[tokio::test]
    async fn target_for_scoring_is_stable_given_same_membership() {
        let view = MembershipView::new(Endpoint::new("self", vec![]), false);
        view.apply_slice_update(
            "slice-a".into(),
            1,
            vec![ep("scheduler-a"), ep("scheduler-b"), ep("scheduler-c")],
        )
        .await;

        let key = PodKey::new("default", "web-0");
        let a = view.target_for_scoring(&key).await;
        let b = view.target_for_scoring(&key).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn single_member_is_its_own_target_without_hashing() {
        let view = MembershipView::new(Endpoint::new("self", vec![]), false);
        view.apply_slice_update("slice-a".into(), 1, vec![ep("scheduler-a")])
            .await;
        let target = view
            .target_for_scoring(&PodKey::new("default", "web-0"))
            .await
            .unwrap();
        assert_eq!(target.pod_name, "scheduler-a");
    }
}
