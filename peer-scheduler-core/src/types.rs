use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known prefix that marks an endpoint as a relay rather than a
/// scheduler. Configurable in principle, but fixed here to match the
/// convention the rest of the cluster tooling assumes.
pub const RELAY_PREFIX: &str = "relay-";

/// One peer in the cluster: a pod name plus its reachable addresses.
/// Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub pod_name: String,
    pub addresses: Vec<String>,
}

impl Endpoint {
    pub fn new(pod_name: impl Into<String>, addresses: Vec<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            addresses,
        }
    }

    /// Role is derived entirely from the name prefix — there is no
    /// separate role field to keep out of sync with it.
    pub fn role(&self) -> Role {
        if self.pod_name.starts_with(RELAY_PREFIX) {
            Role::Relay
        } else {
            Role::Scheduler
        }
    }

    pub fn is_relay(&self) -> bool {
        matches!(self.role(), Role::Relay)
    }

    /// First address, or `None` for an endpoint with no addresses yet
    /// (e.g. a pod that hasn't been assigned an IP).
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Scheduler,
    Relay,
}

/// `"<namespace>/<name>"` — identifies a pod for hashing and for the
/// per-pod evaluator table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey(String);

impl PodKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits back into `(namespace, name)`. Panics only if constructed
    /// outside of `PodKey::new`, which this crate never does.
    pub fn split(&self) -> (&str, &str) {
        self.0
            .split_once('/')
            .expect("PodKey is always namespace/name")
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A description of a pending workload unit, independent of its wire
/// encoding. The relay layer and the embedded scheduling engine both
/// consume this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub scheduler_name: String,
    /// Opaque pod spec — never inspected by the relay tree, only by the
    /// embedded scheduling engine.
    pub spec: Vec<u8>,
}

impl Pod {
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }
}

/// One peer's reported score for one node, as collected by the
/// aggregator (C6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeScore {
    pub node_name: String,
    pub score: i64,
}

/// The aggregator's decision for a pod key: which node won, and with
/// what score.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Winner {
    pub node_name: String,
    pub score: i64,
}
