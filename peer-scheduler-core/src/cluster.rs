//! External collaborators (§1, §6): the cluster-API watch/inform
//! infrastructure and leader election. These are out of scope for the
//! core decision pipeline, so this module only commits to trait
//! boundaries plus a `kube`-backed default implementation of each —
//! mirroring the teacher's `ProcessStore` trait with its
//! `MemoryStore`/`PostgresProcessStore` pair, this module pairs every
//! trait with a `Kube*` adapter and an in-memory fake used by tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Endpoints, EndpointSubset, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::intake::IntakeQueue;
use crate::membership::MembershipView;
use crate::partition::NodeRecord;
use crate::types::{Endpoint as PeerEndpoint, Pod as PodDesc};

/// Label written on every node naming the scheduler peer responsible
/// for it (the "partition label" of the glossary).
pub const PARTITION_LABEL: &str = "peer-scheduler.io/group";

// ───────────────────────── Node inventory (C3) ─────────────────────────

#[async_trait]
pub trait NodeInventorySource: Send + Sync {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeRecord>>;
}

#[async_trait]
pub trait NodeLabeler: Send + Sync {
    async fn set_group_label(&self, node_name: &str, group: &str) -> anyhow::Result<()>;
}

pub struct KubeNodeInventory {
    nodes: Api<Node>,
    label_selector: String,
}

impl KubeNodeInventory {
    pub fn new(client: Client) -> Self {
        Self::with_label_selector(client, String::new())
    }

    /// Scopes the partitioner to nodes matching `label_selector`
    /// (empty selects every node in the cluster).
    pub fn with_label_selector(client: Client, label_selector: String) -> Self {
        Self {
            nodes: Api::all(client),
            label_selector,
        }
    }
}

#[async_trait]
impl NodeInventorySource for KubeNodeInventory {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeRecord>> {
        let params = if self.label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&self.label_selector)
        };
        let list = self.nodes.list(&params).await?;
        Ok(list
            .into_iter()
            .filter_map(|n| {
                let name = n.metadata.name?;
                let current_group = n
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(PARTITION_LABEL))
                    .cloned();
                Some(NodeRecord {
                    name,
                    current_group,
                })
            })
            .collect())
    }
}

pub struct KubeNodeLabeler {
    nodes: Api<Node>,
}

impl KubeNodeLabeler {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeLabeler for KubeNodeLabeler {
    async fn set_group_label(&self, node_name: &str, group: &str) -> anyhow::Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "labels": {
                    PARTITION_LABEL: group,
                }
            }
        });
        self.nodes
            .patch(node_name, &PatchParams::apply("peer-scheduler"), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// In-memory fake for tests: a fixed node list with mutable labels.
#[derive(Default)]
pub struct FakeNodeInventory {
    nodes: RwLock<HashMap<String, Option<String>>>,
}

impl FakeNodeInventory {
    pub fn new(node_names: impl IntoIterator<Item = String>) -> Self {
        let nodes = node_names.into_iter().map(|n| (n, None)).collect();
        Self {
            nodes: RwLock::new(nodes),
        }
    }
}

#[async_trait]
impl NodeInventorySource for FakeNodeInventory {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeRecord>> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .iter()
            .map(|(name, group)| NodeRecord {
                name: name.clone(),
                current_group: group.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl NodeLabeler for FakeNodeInventory {
    async fn set_group_label(&self, node_name: &str, group: &str) -> anyhow::Result<()> {
        let mut nodes = self.nodes.write().await;
        nodes.insert(node_name.to_string(), Some(group.to_string()));
        Ok(())
    }
}

// ───────────────────────── Endpoint discovery (C1) ─────────────────────────

#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Runs until `shutdown` fires, feeding every add/update/delete into
    /// `membership`. Errors are fatal to the watcher task — the caller
    /// is expected to restart it with backoff.
    async fn run(
        &self,
        membership: Arc<MembershipView>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Watches `EndpointSlice` objects label-selected to the peer Service's
/// name. A Kubernetes Service shards its endpoints across possibly
/// several slices, so membership is ingested per-slice and merged by
/// `MembershipView`, not replaced wholesale on every event.
pub struct KubeEndpointSliceSource {
    slices: Api<k8s_openapi::api::discovery::v1::EndpointSlice>,
    service_label_selector: String,
}

impl KubeEndpointSliceSource {
    pub fn new(client: Client, namespace: &str, service_name: &str) -> Self {
        Self {
            slices: Api::namespaced(client, namespace),
            service_label_selector: format!("kubernetes.io/service-name={service_name}"),
        }
    }
}

#[async_trait]
impl EndpointSource for KubeEndpointSliceSource {
    async fn run(
        &self,
        membership: Arc<MembershipView>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let config = watcher::Config::default().labels(&self.service_label_selector);
        let mut stream = Box::pin(watcher::watcher(self.slices.clone(), config));

        loop {
            tokio::select! {
                event = stream.try_next() => {
                    let Some(event) = event? else { break };
                    apply_endpoint_slice_event(&membership, event).await;
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn apply_endpoint_slice_event(
    membership: &MembershipView,
    event: watcher::Event<k8s_openapi::api::discovery::v1::EndpointSlice>,
) {
    use watcher::Event;
    match event {
        Event::Apply(slice) | Event::InitApply(slice) => {
            let Some(name) = slice.metadata.name.clone() else {
                return;
            };
            let generation = slice.metadata.generation.unwrap_or(0).max(0) as u64;
            let endpoints = slice
                .endpoints
                .iter()
                .filter_map(|e| {
                    let pod_name = e.target_ref.as_ref()?.name.clone()?;
                    Some(PeerEndpoint::new(pod_name, e.addresses.clone()))
                })
                .collect();
            membership
                .apply_slice_update(name, generation, endpoints)
                .await;
        }
        Event::Delete(slice) => {
            if let Some(name) = slice.metadata.name {
                membership.apply_slice_delete(&name).await;
            }
        }
        Event::Init | Event::InitDone => {}
    }
}

/// In-memory fake: lets tests push slice updates directly.
pub struct FakeEndpointSource {
    pub updates: RwLock<Vec<(String, u64, Vec<PeerEndpoint>)>>,
}

#[async_trait]
impl EndpointSource for FakeEndpointSource {
    async fn run(
        &self,
        membership: Arc<MembershipView>,
        _shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let updates = self.updates.read().await.clone();
        for (slice, generation, endpoints) in updates {
            membership.apply_slice_update(slice, generation, endpoints).await;
        }
        Ok(())
    }
}

// ───────────────────────── Pod watch, leader-only (C4) ─────────────────────────

#[async_trait]
pub trait PodSource: Send + Sync {
    async fn run(
        &self,
        intake: Arc<IntakeQueue>,
        scheduler_name: String,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Subscribes to unscheduled-pod events, field-filtered server-side to
/// `spec.schedulerName=<ours>,spec.nodeName=` (grounded on the same
/// field-selector idiom used across the pack's watcher-based
/// schedulers).
pub struct KubePodWatcher {
    pods: Api<Pod>,
}

impl KubePodWatcher {
    pub fn new(client: Client) -> Self {
        Self {
            pods: Api::all(client),
        }
    }
}

#[async_trait]
impl PodSource for KubePodWatcher {
    async fn run(
        &self,
        intake: Arc<IntakeQueue>,
        scheduler_name: String,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let config = watcher::Config::default()
            .fields(&format!("spec.schedulerName={scheduler_name},spec.nodeName="));
        let mut stream = Box::pin(watcher::watcher(self.pods.clone(), config).applied_objects());

        loop {
            tokio::select! {
                item = stream.try_next() => {
                    let Some(pod) = item? else { break };
                    if let Some(desc) = pod_to_desc(&pod, &scheduler_name) {
                        if intake.enqueue(desc).await.is_err() {
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn pod_to_desc(pod: &Pod, scheduler_name: &str) -> Option<PodDesc> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let uid = pod.metadata.uid.clone().unwrap_or_default();
    let requested = pod.spec.as_ref()?.scheduler_name.clone().unwrap_or_default();
    if requested != scheduler_name {
        return None;
    }
    if pod.spec.as_ref().and_then(|s| s.node_name.clone()).is_some() {
        return None;
    }
    let spec = serde_json::to_vec(&pod.spec).ok()?;
    Some(PodDesc {
        namespace,
        name,
        uid,
        scheduler_name: requested,
        spec,
    })
}

// ───────────────────────── Leader election ─────────────────────────

#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Runs until `shutdown` fires, pushing the current leader's pod
    /// name (or `None` while no one holds the lease) on every change.
    async fn run(
        &self,
        on_change: mpsc::Sender<Option<String>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Minimal lease-based leader election against
/// `coordination.k8s.io/v1::Lease`: this peer tries to acquire or renew
/// the lease every `renew_interval`; on success it is leader, on
/// failure (someone else holds an unexpired lease) it is not.
///
/// This is deliberately the simplest correct implementation — the
/// specification treats leader election as an external collaborator
/// (§6f) and only requires that exactly one peer believe it is leader
/// at a time.
pub struct KubeLeaderElection {
    leases: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl KubeLeaderElection {
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let now = MicroTime(chrono_now());
        match self.leases.get_opt(&self.lease_name).await? {
            None => {
                let lease = Lease {
                    metadata: kube::core::ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..Default::default()
                    },
                    spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                        renew_time: Some(now),
                        acquire_time: Some(now),
                        ..Default::default()
                    }),
                };
                self.leases.create(&Default::default(), &lease).await?;
                Ok(true)
            }
            Some(existing) => {
                let spec = existing.spec.unwrap_or_default();
                let held_by_us = spec.holder_identity.as_deref() == Some(&self.identity);
                let expired = spec
                    .renew_time
                    .map(|t| chrono_now().signed_duration_since(t.0).num_seconds()
                        > spec.lease_duration_seconds.unwrap_or(15) as i64)
                    .unwrap_or(true);

                if held_by_us || expired {
                    let patch = serde_json::json!({
                        "spec": {
                            "holderIdentity": self.identity,
                            "renewTime": now,
                            "leaseDurationSeconds": self.lease_duration.as_secs() as i32,
                        }
                    });
                    self.leases
                        .patch(
                            &self.lease_name,
                            &PatchParams::apply("peer-scheduler"),
                            &Patch::Merge(&patch),
                        )
                        .await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }
}

fn chrono_now() -> chrono_like::DateTime {
    chrono_like::DateTime::now()
}

/// A tiny seam so this module doesn't have to pull in `chrono` just for
/// lease timestamps (the core crate otherwise has no use for it, see
/// DESIGN.md on dropped dependencies) — backed by `k8s_openapi`'s own
/// re-exported time type.
mod chrono_like {
    pub use k8s_openapi::chrono::{DateTime, Utc};
    pub type DateTimeUtc = DateTime<Utc>;

    pub struct DateTime;
    impl DateTime {
        pub fn now() -> DateTimeUtc {
            Utc::now()
        }
    }
}

#[async_trait]
impl LeaderElection for KubeLeaderElection {
    async fn run(
        &self,
        on_change: mpsc::Sender<Option<String>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut was_leader = false;
        let mut ticker = tokio::time::interval(self.renew_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let is_leader = self.try_acquire().await.unwrap_or(false);
                    if is_leader != was_leader {
                        was_leader = is_leader;
                        let leader = if is_leader { Some(self.identity.clone()) } else { None };
                        if on_change.send(leader).await.is_err() {
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Deterministic fake for tests: always leader, never changes.
pub struct FakeLeaderElection {
    pub identity: String,
}

#[async_trait]
impl LeaderElection for FakeLeaderElection {
    async fn run(
        &self,
        on_change: mpsc::Sender<Option<String>>,
        _shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let _ = on_change.send(Some(self.identity.clone())).await;
        Ok(())
    }
}

// ───────────────────────── Webhook endpoint publication ─────────────────────────

/// Advertises (or clears) the admission-webhook's `Endpoints` record so
/// the cluster only ever routes webhook calls to the current leader.
#[async_trait]
pub trait WebhookEndpointPublisher: Send + Sync {
    async fn publish(&self, ip: &str, port: u16) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

pub struct KubeWebhookEndpointPublisher {
    endpoints: Api<Endpoints>,
    name: String,
}

impl KubeWebhookEndpointPublisher {
    pub fn new(client: Client, namespace: &str, service_name: &str) -> Self {
        Self {
            endpoints: Api::namespaced(client, namespace),
            name: service_name.to_string(),
        }
    }
}

#[async_trait]
impl WebhookEndpointPublisher for KubeWebhookEndpointPublisher {
    async fn publish(&self, ip: &str, port: u16) -> anyhow::Result<()> {
        let endpoints = Endpoints {
            metadata: kube::core::ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![k8s_openapi::api::core::v1::EndpointAddress {
                    ip: ip.to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![k8s_openapi::api::core::v1::EndpointPort {
                    port: port as i32,
                    ..Default::default()
                }]),
                not_ready_addresses: None,
            }]),
        };
        self.endpoints
            .patch(
                &self.name,
                &PatchParams::apply("peer-scheduler"),
                &Patch::Apply(&endpoints),
            )
            .await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let patch = serde_json::json!({ "subsets": [] });
        self.endpoints
            .patch(&self.name, &PatchParams::apply("peer-scheduler"), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// In-memory fake recording the last published state, for tests of the
/// leader-handoff scenario (S4).
#[derive(Default)]
pub struct FakeWebhookEndpointPublisher {
    pub published: RwLock<Option<(String, u16)>>,
}

#[async_trait]
impl WebhookEndpointPublisher for FakeWebhookEndpointPublisher {
    async fn publish(&self, ip: &str, port: u16) -> anyhow::Result<()> {
        *self.published.write().await = Some((ip.to_string(), port));
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.published.write().await = None;
        Ok(())
    }
}
