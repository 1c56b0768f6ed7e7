mod grpc;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use peer_scheduler_core::aggregator::ScoreAggregator;
use peer_scheduler_core::cluster::{
    EndpointSource, KubeEndpointSliceSource, KubeLeaderElection, KubeNodeInventory,
    KubeNodeLabeler, KubePodWatcher, KubeWebhookEndpointPublisher, LeaderElection, PodSource,
    WebhookEndpointPublisher,
};
use peer_scheduler_core::config::Config;
use peer_scheduler_core::dispatch::{DispatchCore, DispatchWorkers, EnginePool};
use peer_scheduler_core::engine::SchedulingEngine;
use peer_scheduler_core::intake::IntakeQueue;
use peer_scheduler_core::logging;
use peer_scheduler_core::membership::MembershipView;
use peer_scheduler_core::metrics::{Metrics, NoopMetrics};
use peer_scheduler_core::partition::{NodePartitioner, RotationPolicy};
use peer_scheduler_core::permit::{PermitPlugin, TonicScoreClient};
use peer_scheduler_core::relay::RelayClientPool;
use peer_scheduler_core::topology::RelayTopology;
use peer_scheduler_core::types::Endpoint;
use peer_scheduler_core::wire::proto::peer_scheduler_server::PeerSchedulerServer;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::PeerSchedulerService;
use crate::webhook::WebhookState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::parse();
    tracing::info!(pod_name = %config.pod_name, "starting peer-scheduler");

    let client = kube::Client::try_default().await?;
    let shutdown = CancellationToken::new();

    let self_endpoint = Endpoint::new(config.pod_name.clone(), vec![config.pod_ip.clone()]);
    let membership = Arc::new(MembershipView::new(self_endpoint, config.allow_solo));

    let endpoint_source = KubeEndpointSliceSource::new(client.clone(), &config.pod_namespace, &config.service_name);
    tokio::spawn({
        let membership = membership.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = endpoint_source.run(membership, shutdown).await {
                tracing::error!(error = %err, "endpoint watcher exited");
            }
        }
    });

    let (leader_tx, mut leader_rx) = tokio::sync::mpsc::channel(4);
    if config.leader_eligible {
        let leader_election = KubeLeaderElection::new(
            client.clone(),
            &config.pod_namespace,
            "peer-scheduler-leader",
            &config.pod_name,
        );
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(err) = leader_election.run(leader_tx, shutdown).await {
                    tracing::error!(error = %err, "leader election exited");
                }
            }
        });
    }

    let webhook_publisher = KubeWebhookEndpointPublisher::new(client.clone(), &config.pod_namespace, &config.service_name);
    tokio::spawn({
        let membership = membership.clone();
        let config = config.clone();
        async move {
            while let Some(leader) = leader_rx.recv().await {
                membership.set_leader(leader.clone()).await;
                let is_leader = leader.as_deref() == Some(config.pod_name.as_str());
                if is_leader {
                    if let Err(err) = webhook_publisher.publish(&config.pod_ip, webhook_port(&config)).await {
                        tracing::warn!(error = %err, "failed to publish webhook endpoint");
                    }
                } else if let Err(err) = webhook_publisher.clear().await {
                    tracing::warn!(error = %err, "failed to clear webhook endpoint");
                }
            }
        }
    });

    let node_inventory = Arc::new(KubeNodeInventory::with_label_selector(
        client.clone(),
        config.node_label_selector.clone(),
    ));
    let node_labeler = Arc::new(KubeNodeLabeler::new(client.clone()));
    let partitioner = Arc::new(NodePartitioner::new(
        node_inventory,
        node_labeler,
        RotationPolicy::Compact,
        config.partition_tick_interval,
    ));
    tokio::spawn({
        let membership = membership.clone();
        let shutdown = shutdown.clone();
        async move {
            partitioner.run(membership, shutdown).await;
        }
    });

    let (intake, intake_rx) = IntakeQueue::new(config.intake_queue_depth);

    if config.watch_pods {
        let pod_watcher = KubePodWatcher::new(client.clone());
        let intake = Arc::new(intake.clone());
        let scheduler_name = config.scheduler_name.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = pod_watcher.run(intake, scheduler_name, shutdown).await {
                tracing::error!(error = %err, "pod watcher exited");
            }
        });
    } else {
        let state = WebhookState {
            intake: intake.clone(),
            scheduler_name: config.scheduler_name.clone(),
        };
        let addr = config.webhook_bind_addr.parse()?;
        let cert_dir = config.webhook_cert_dir.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = webhook::serve(addr, cert_dir, state, shutdown).await {
                tracing::error!(error = %err, "webhook server exited");
            }
        });
    }

    let topology = Arc::new(RelayTopology::new(config.pod_name.clone(), config.fan_out));
    let relay_pool = Arc::new(RelayClientPool::new());
    let score_client = Arc::new(TonicScoreClient::new());
    let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);

    let permit_plugin = Arc::new(PermitPlugin::new(
        membership.clone(),
        score_client.clone(),
        config.permit_always_deny,
    ));

    let engines: Vec<Box<dyn SchedulingEngine>> = (0..config.worker_count)
        .map(|_| {
            Box::new(StubSchedulingEngine {
                permit: permit_plugin.clone(),
            }) as Box<dyn SchedulingEngine>
        })
        .collect();
    let engine_pool = Arc::new(EnginePool::new(engines));

    let dispatch_core = Arc::new(DispatchCore {
        relay_pool: relay_pool.clone(),
        topology,
        membership: membership.clone(),
        engines: engine_pool,
        score_client: score_client.clone(),
        relay_only: config.relay_only,
        sub_scheduler_wait_ratio: config.sub_scheduler_wait_ratio,
        sub_scheduler_wait_deadline: config.sub_scheduler_wait_deadline,
        relay_log_sampler: Arc::new(peer_scheduler_core::logging::SamplingFilter::new(config.log_sample_denominator)),
        metrics: metrics.clone(),
    });

    let dispatch_workers = Arc::new(DispatchWorkers::new(dispatch_core.clone(), intake_rx, config.worker_count));
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            dispatch_workers.run(shutdown).await;
        }
    });

    let aggregator = Arc::new(ScoreAggregator::with_metrics(config.aggregator_deadline, metrics.clone()));
    let service = PeerSchedulerService::new(
        dispatch_core,
        membership,
        aggregator,
        metrics,
        config.worker_count,
    );

    let grpc_addr = config.grpc_listen_addr.parse()?;
    tracing::info!(addr = %grpc_addr, "relay gRPC server listening");

    tokio::select! {
        result = Server::builder()
            .add_service(PeerSchedulerServer::new(service))
            .serve(grpc_addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    Ok(())
}

fn webhook_port(config: &Config) -> u16 {
    config
        .webhook_bind_addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(8443)
}

/// Placeholder embedded scheduling engine wired in by default: a
/// complete `SchedulingEngine` — the actual filter/score/bind logic —
/// is an external collaborator (§1), so a real deployment supplies its
/// own. This stub exercises the rest of the pipeline end to end by
/// proposing a single synthetic node and running it through the real
/// permit plugin.
struct StubSchedulingEngine {
    permit: Arc<PermitPlugin>,
}

#[tonic::async_trait]
impl SchedulingEngine for StubSchedulingEngine {
    async fn schedule_one(
        &mut self,
        pod: peer_scheduler_core::types::Pod,
        handle: peer_scheduler_core::engine::DispatchHandle,
    ) -> anyhow::Result<()> {
        let mut scores = std::collections::HashMap::new();
        scores.insert("unscheduled".to_string(), 1i64);
        let granted = self.permit.permit(&pod, "unscheduled", &scores, &handle).await;
        tracing::debug!(pod = %pod.key(), granted, "stub engine permit decision");
        Ok(())
    }
}
