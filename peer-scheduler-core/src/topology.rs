//! C2 — Relay Topology.
//!
//! Computes this peer's downstream fan-out list from the sorted
//! membership snapshot, using a deterministic 10-ary tree layout. Purely
//! positional: index `i` relays to the slice `[i*fan_out + 1, ...)`.
//! Recomputed lazily behind a dirty flag — never cached across a leader
//! change, since a leader change can move every peer to a different
//! index.

use std::sync::Mutex;

use crate::membership::MembershipView;
use crate::types::Endpoint;

pub const DEFAULT_FAN_OUT: usize = 10;

/// Pure function: given the sorted membership and this peer's index in
/// it, compute the sub-member slice.
pub fn sub_members(sorted: &[Endpoint], self_index: usize, fan_out: usize) -> Vec<Endpoint> {
    let m = sorted.len();
    if m <= 1 {
        return Vec::new();
    }
    let start = self_index * fan_out + 1;
    if start >= m {
        return Vec::new();
    }
    let end = (start + fan_out).min(m);
    sorted[start..end].to_vec()
}

fn self_index(sorted: &[Endpoint], self_pod_name: &str) -> Option<usize> {
    sorted.iter().position(|e| e.pod_name == self_pod_name)
}

struct Cached {
    generation: u64,
    sub_members: Vec<Endpoint>,
}

/// Caches the last computed sub-member list, keyed by the membership
/// view's dirty generation counter so a reader only recomputes when
/// membership or leader actually changed.
pub struct RelayTopology {
    self_pod_name: String,
    fan_out: usize,
    cache: Mutex<Option<Cached>>,
}

impl RelayTopology {
    pub fn new(self_pod_name: impl Into<String>, fan_out: usize) -> Self {
        Self {
            self_pod_name: self_pod_name.into(),
            fan_out,
            cache: Mutex::new(None),
        }
    }

    /// Returns this peer's current sub-members, recomputing only if the
    /// membership view's generation has moved past what's cached.
    pub async fn sub_members(&self, membership: &MembershipView) -> Vec<Endpoint> {
        let generation = *membership.subscribe().borrow();

        {
            let cache = self.cache.lock().expect("topology cache lock poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.generation == generation {
                    return cached.sub_members.clone();
                }
            }
        }

        let sorted = membership.members().await;
        let computed = match self_index(&sorted, &self.self_pod_name) {
            Some(idx) => sub_members(&sorted, idx, self.fan_out),
            None => Vec::new(),
        };

        let mut cache = self.cache.lock().expect("topology cache lock poisoned");
        *cache = Some(Cached {
            generation,
            sub_members: computed.clone(),
        });
        computed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(name: &str) -> Endpoint {
        Endpoint::new(name, vec![])
    }

    fn chain(names: &[&str]) -> Vec<Endpoint> {
        names.iter().map(|n| ep(n)).collect()
    }

    #[test]
    fn single_or_empty_membership_has_no_sub_members() {
        assert!(sub_members(&[], 0, 10).is_empty());
        assert!(sub_members(&chain(&["a"]), 0, 10).is_empty());
    }

    #[test]
    fn leader_with_eleven_peers_relays_to_all_ten() {
        let names: Vec<String> = (0..11).map(|i| format!("p{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let sorted = chain(&refs);
        let sub = sub_members(&sorted, 0, 10);
        assert_eq!(sub.len(), 10);
        assert_eq!(sub[0].pod_name, "p1");
        assert_eq!(sub[9].pod_name, "p10");
    }

    #[test]
    fn leaf_beyond_membership_size_has_no_sub_members() {
        let sorted = chain(&["a", "b", "c"]);
        // index 1 -> start = 1*10+1 = 11, way past len 3
        assert!(sub_members(&sorted, 1, 10).is_empty());
    }

    #[test]
    fn topology_coverage_property() {
        // Property test (§8 property 3): for a membership of size M, the
        // union of every peer's sub-member list equals members[1..M]
        // exactly, no duplicates, no gaps.
        for m in [2usize, 5, 11, 23, 101] {
            let names: Vec<String> = (0..m).map(|i| format!("p{i:03}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let sorted = chain(&refs);

            let mut covered = std::collections::HashSet::new();
            for i in 0..m {
                for e in sub_members(&sorted, i, 10) {
                    assert!(covered.insert(e.pod_name.clone()), "duplicate coverage of {}", e.pod_name);
                }
            }
            let expected: std::collections::HashSet<String> =
                sorted[1..].iter().map(|e| e.pod_name.clone()).collect();
            assert_eq!(covered, expected, "m={m}");
        }
    }

    #[tokio::test]
    async fn recomputes_only_after_membership_changes() {
        let membership = MembershipView::new(ep("scheduler-a"), false);
        membership
            .apply_slice_update(
                "slice".into(),
                1,
                vec![ep("scheduler-a"), ep("scheduler-b")],
            )
            .await;

        let topo = RelayTopology::new("scheduler-a", 10);
        let first = topo.sub_members(&membership).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].pod_name, "scheduler-b");

        // Same membership: cached value returned (would panic on a race
        // only if we recomputed against a torn snapshot, which we don't).
        let second = topo.sub_members(&membership).await;
        assert_eq!(first, second);

        membership
            .apply_slice_update(
                "slice".into(),
                2,
                vec![ep("scheduler-a"), ep("scheduler-b"), ep("scheduler-c")],
            )
            .await;
        let third = topo.sub_members(&membership).await;
        assert_eq!(third.len(), 2);
    }
}
