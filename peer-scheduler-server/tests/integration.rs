//! Integration tests: exercise the full single-process pipeline that
//! the gRPC/webhook handlers delegate to — intake → dispatch → embedded
//! engine → permit — the same way the teacher's integration suite
//! drives its engine facade directly rather than going over the wire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peer_scheduler_core::dispatch::{DispatchCore, DispatchWorkers, EnginePool};
use peer_scheduler_core::engine::{DispatchHandle, SchedulingEngine};
use peer_scheduler_core::intake::IntakeQueue;
use peer_scheduler_core::logging::SamplingFilter;
use peer_scheduler_core::membership::MembershipView;
use peer_scheduler_core::metrics::NoopMetrics;
use peer_scheduler_core::permit::{PermitPlugin, ScoreClient};
use peer_scheduler_core::relay::RelayClientPool;
use peer_scheduler_core::topology::RelayTopology;
use peer_scheduler_core::types::{Endpoint, Pod};

/// Grants or denies every `CollectScore` call uniformly, recording how
/// many times it was invoked.
struct FakeScoreClient {
    grant: bool,
    calls: std::sync::atomic::AtomicUsize,
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
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.grant
    }
}

/// An embedded engine that proposes a single fixed node and defers the
/// rest of the decision to the real permit plugin — the same shape as
/// the server binary's own default engine, duplicated here so the test
/// doesn't depend on `main.rs`'s private type.
struct FixedNodeEngine {
    node_name: String,
    score: i64,
    permit: Arc<PermitPlugin>,
    grants: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl SchedulingEngine for FixedNodeEngine {
    async fn schedule_one(&mut self, pod: Pod, handle: DispatchHandle) -> anyhow::Result<()> {
        let mut scores = HashMap::new();
        scores.insert(self.node_name.clone(), self.score);
        if self.permit.permit(&pod, &self.node_name, &scores, &handle).await {
            self.grants.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }
}

fn test_pod(name: &str) -> Pod {
    Pod {
        namespace: "default".into(),
        name: name.into(),
        uid: format!("uid-{name}"),
        scheduler_name: "peer-scheduler".into(),
        spec: Vec::new(),
    }
}

/// A lone peer (solo mode): no relay fan-out, every pod is scheduled
/// and permitted locally against its own `CollectScore` target.
#[tokio::test]
async fn solo_peer_schedules_and_permits_without_a_network() {
    let self_endpoint = Endpoint::new("scheduler-0", vec!["10.0.0.1".into()]);
    let membership = Arc::new(MembershipView::new(self_endpoint, true));

    let score_client = Arc::new(FakeScoreClient {
        grant: true,
        calls: Default::default(),
    });
    let permit_plugin = Arc::new(PermitPlugin::new(membership.clone(), score_client.clone(), false));
    let grants = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let engines: Vec<Box<dyn SchedulingEngine>> = (0..2)
        .map(|_| {
            Box::new(FixedNodeEngine {
                node_name: "node-a".into(),
                score: 5,
                permit: permit_plugin.clone(),
                grants: grants.clone(),
            }) as Box<dyn SchedulingEngine>
        })
        .collect();

    let dispatch_core = Arc::new(DispatchCore {
        relay_pool: Arc::new(RelayClientPool::new()),
        topology: Arc::new(RelayTopology::new("scheduler-0", 10)),
        membership,
        engines: Arc::new(EnginePool::new(engines)),
        score_client,
        relay_only: false,
        sub_scheduler_wait_ratio: 1.0,
        sub_scheduler_wait_deadline: Duration::from_millis(200),
        relay_log_sampler: Arc::new(SamplingFilter::new(100)),
        metrics: Arc::new(NoopMetrics),
    });

    let (intake, intake_rx) = IntakeQueue::new(16);
    let workers = Arc::new(DispatchWorkers::new(dispatch_core, intake_rx, 2));

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(workers.run(shutdown.clone()));

    intake.enqueue(test_pod("web-0")).await.unwrap();
    intake.enqueue(test_pod("web-1")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    drop(intake);
    handle.await.unwrap();

    assert_eq!(grants.load(std::sync::atomic::Ordering::SeqCst), 2);
}

/// `relay_only` peers must never run the embedded engine, even though
/// they still own a (possibly empty) pool of engines.
#[tokio::test]
async fn relay_only_peer_never_invokes_the_embedded_engine() {
    let self_endpoint = Endpoint::new("relay-0", vec!["10.0.0.2".into()]);
    let membership = Arc::new(MembershipView::new(self_endpoint, true));

    let score_client = Arc::new(FakeScoreClient {
        grant: true,
        calls: Default::default(),
    });
    let permit_plugin = Arc::new(PermitPlugin::new(membership.clone(), score_client.clone(), false));
    let grants = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let engines: Vec<Box<dyn SchedulingEngine>> = vec![Box::new(FixedNodeEngine {
        node_name: "node-a".into(),
        score: 5,
        permit: permit_plugin,
        grants: grants.clone(),
    })];

    let dispatch_core = Arc::new(DispatchCore {
        relay_pool: Arc::new(RelayClientPool::new()),
        topology: Arc::new(RelayTopology::new("relay-0", 10)),
        membership,
        engines: Arc::new(EnginePool::new(engines)),
        score_client,
        relay_only: true,
        sub_scheduler_wait_ratio: 1.0,
        sub_scheduler_wait_deadline: Duration::from_millis(50),
        relay_log_sampler: Arc::new(SamplingFilter::new(100)),
        metrics: Arc::new(NoopMetrics),
    });

    dispatch_core.process_one(0, test_pod("web-0")).await;

    assert_eq!(grants.load(std::sync::atomic::Ordering::SeqCst), 0);
}

/// A zero local score is never permitted and must not block the
/// dispatcher on the fire-and-forget `CollectScore` report.
#[tokio::test]
async fn zero_score_completes_promptly_without_permit() {
    let self_endpoint = Endpoint::new("scheduler-0", vec!["10.0.0.1".into()]);
    let membership = Arc::new(MembershipView::new(self_endpoint, true));

    let score_client = Arc::new(FakeScoreClient {
        grant: true,
        calls: Default::default(),
    });
    let permit_plugin = Arc::new(PermitPlugin::new(membership.clone(), score_client.clone(), false));
    let grants = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let engines: Vec<Box<dyn SchedulingEngine>> = vec![Box::new(FixedNodeEngine {
        node_name: "node-a".into(),
        score: 0,
        permit: permit_plugin,
        grants: grants.clone(),
    })];

    let dispatch_core = Arc::new(DispatchCore {
        relay_pool: Arc::new(RelayClientPool::new()),
        topology: Arc::new(RelayTopology::new("scheduler-0", 10)),
        membership,
        engines: Arc::new(EnginePool::new(engines)),
        score_client,
        relay_only: false,
        sub_scheduler_wait_ratio: 1.0,
        sub_scheduler_wait_deadline: Duration::from_millis(50),
        relay_log_sampler: Arc::new(SamplingFilter::new(100)),
        metrics: Arc::new(NoopMetrics),
    });

    tokio::time::timeout(Duration::from_millis(500), dispatch_core.process_one(0, test_pod("web-0")))
        .await
        .expect("zero-score dispatch must not stall waiting on its own fire-and-forget report");

    assert_eq!(grants.load(std::sync::atomic::Ordering::SeqCst), 0);
}
