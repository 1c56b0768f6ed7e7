//! C7 — Permit Plugin.
//!
//! Invoked by the embedded scheduling engine at its Permit stage.
//! Resolves the pod's designated aggregator peer via C1's
//! `target_for_scoring`, reports this peer's local score to it over
//! `CollectScore`, and turns the resulting permit decision into the
//! engine's Success/Unschedulable verdict.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint as TonicEndpoint};

use crate::engine::DispatchHandle;
use crate::membership::MembershipView;
use crate::relay::DEFAULT_RELAY_PORT;
use crate::types::{Endpoint, Pod};
use crate::wire::proto::peer_scheduler_client::PeerSchedulerClient;
use crate::wire::proto::ScoreReport;

/// Collaborator boundary for the `CollectScore` RPC, so permit logic is
/// testable without a network.
#[async_trait]
pub trait ScoreClient: Send + Sync {
    async fn collect_score(
        &self,
        target: &Endpoint,
        namespace: &str,
        pod_name: &str,
        node_name: &str,
        score: i64,
    ) -> bool;
}

/// `tonic`-backed client with a small connection cache, since
/// `CollectScore` is unary and much lower-volume than the relay
/// streams C5 keeps warm.
pub struct TonicScoreClient {
    channels: Mutex<HashMap<String, Channel>>,
}

impl Default for TonicScoreClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TonicScoreClient {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn channel_for(&self, target: &Endpoint) -> anyhow::Result<Channel> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&target.pod_name) {
            return Ok(channel.clone());
        }
        let address = target
            .primary_address()
            .ok_or_else(|| anyhow::anyhow!("peer {} has no address", target.pod_name))?;
        let uri = format!("http://{address}:{DEFAULT_RELAY_PORT}");
        let channel = TonicEndpoint::from_shared(uri)?.connect().await?;
        channels.insert(target.pod_name.clone(), channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl ScoreClient for TonicScoreClient {
    async fn collect_score(
        &self,
        target: &Endpoint,
        namespace: &str,
        pod_name: &str,
        node_name: &str,
        score: i64,
    ) -> bool {
        let channel = match self.channel_for(target).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(peer = %target.pod_name, error = %err, "could not dial aggregator peer");
                return false;
            }
        };
        let mut client = PeerSchedulerClient::new(channel);
        let request = ScoreReport {
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            node_name: node_name.to_string(),
            score: score as i32,
        };
        match client.collect_score(request).await {
            Ok(response) => response.into_inner().permit,
            Err(status) => {
                tracing::warn!(peer = %target.pod_name, error = %status, "collect_score RPC failed");
                false
            }
        }
    }
}

pub struct PermitPlugin {
    membership: Arc<MembershipView>,
    score_client: Arc<dyn ScoreClient>,
    /// Debug flag (§4.7): unconditionally denies, bypassing the RPC
    /// entirely. Wired from `Config::permit_always_deny`.
    always_deny: bool,
}

impl PermitPlugin {
    pub fn new(membership: Arc<MembershipView>, score_client: Arc<dyn ScoreClient>, always_deny: bool) -> Self {
        Self {
            membership,
            score_client,
            always_deny,
        }
    }

    /// Runs the full permit decision for `pod` at `node_name`, given the
    /// engine's locally computed scores. Always signals `handle` before
    /// making the remote call, per §4.8 step 2 — the dispatcher must not
    /// block on a network round trip to learn that local work is done.
    pub async fn permit(
        &self,
        pod: &Pod,
        node_name: &str,
        local_scores: &HashMap<String, i64>,
        handle: &DispatchHandle,
    ) -> bool {
        let score = local_scores.get(node_name).copied();
        handle.signal_done().await;

        let Some(score) = score else {
            tracing::warn!(node = node_name, "permit: no local score on record, denying");
            return false;
        };

        if self.always_deny {
            return false;
        }

        let key = pod.key();
        let Some(target) = self.membership.target_for_scoring(&key).await else {
            return false;
        };

        if score == 0 {
            // Fire-and-forget: still report so the evaluator on the
            // target peer can progress, but the caller need not await a
            // meaningful answer for a score that can never win.
            let client = self.score_client.clone();
            let target = target.clone();
            let namespace = pod.namespace.clone();
            let pod_name = pod.name.clone();
            let node_name = node_name.to_string();
            tokio::spawn(async move {
                client
                    .collect_score(&target, &namespace, &pod_name, &node_name, 0)
                    .await;
            });
            return false;
        }

        self.score_client
            .collect_score(&target, &pod.namespace, &pod.name, node_name, score)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint as PeerEndpoint;

    struct FakeScoreClient {
        permit: bool,
    }

    #[async_trait]
    impl ScoreClient for FakeScoreClient {
        async fn collect_score(
            &self,
            _target: &Endpoint,
            _namespace: &str,
            _pod_name: &str,
            _node_name: &str,
            _score: i64,
        ) -> bool {
            self.permit
        }
    }

    fn pod() -> Pod {
        Pod {
            namespace: "default".into(),
            name: "web-0".into(),
            uid: "uid".into(),
            scheduler_name: "peer-scheduler".into(),
            spec: Vec::new(),
        }
    }

    async fn membership_with_self() -> Arc<MembershipView> {
        let view = Arc::new(MembershipView::new(
            PeerEndpoint::new("scheduler-a", vec!["10.0.0.1".into()]),
            true,
        ));
        view
    }

    #[tokio::test]
    async fn always_deny_short_circuits_before_any_rpc() {
        let membership = membership_with_self().await;
        let client = Arc::new(FakeScoreClient { permit: true });
        let plugin = PermitPlugin::new(membership, client, true);

        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let handle = DispatchHandle::new(tx);
        let mut scores = HashMap::new();
        scores.insert("node-a".to_string(), 5);

        let result = plugin.permit(&pod(), "node-a", &scores, &handle).await;
        assert!(!result);
        assert!(rx.try_recv().is_ok(), "handle must still be signaled");
    }

    #[tokio::test]
    async fn missing_local_score_denies_without_rpc() {
        let membership = membership_with_self().await;
        let client = Arc::new(FakeScoreClient { permit: true });
        let plugin = PermitPlugin::new(membership, client, false);

        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let handle = DispatchHandle::new(tx);
        let scores = HashMap::new();

        assert!(!plugin.permit(&pod(), "node-a", &scores, &handle).await);
    }

    #[tokio::test]
    async fn zero_score_never_permits_and_does_not_block_on_rpc() {
        let membership = membership_with_self().await;
        let client = Arc::new(FakeScoreClient { permit: true });
        let plugin = PermitPlugin::new(membership, client, false);

        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let handle = DispatchHandle::new(tx);
        let mut scores = HashMap::new();
        scores.insert("node-a".to_string(), 0);

        assert!(!plugin.permit(&pod(), "node-a", &scores, &handle).await);
    }

    #[tokio::test]
    async fn positive_score_defers_to_remote_permit_decision() {
        let membership = membership_with_self().await;
        let client = Arc::new(FakeScoreClient { permit: true });
        let plugin = PermitPlugin::new(membership, client, false);

        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let handle = DispatchHandle::new(tx);
        let mut scores = HashMap::new();
        scores.insert("node-a".to_string(), 5);

        assert!(plugin.permit(&pod(), "node-a", &scores, &handle).await);
    }
}
