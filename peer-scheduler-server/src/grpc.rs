//! gRPC server implementation of the `PeerScheduler` service (§6):
//! `NewPod`'s bidirectional relay stream and `CollectScore`'s unary
//! aggregator call. Grounded on the teacher's `grpc.rs` — a thin
//! `tonic`-generated trait impl that hands work off to the core crate
//! and keeps no domain logic of its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use peer_scheduler_core::aggregator::ScoreAggregator;
use peer_scheduler_core::dispatch::DispatchCore;
use peer_scheduler_core::membership::MembershipView;
use peer_scheduler_core::metrics::Metrics;
use peer_scheduler_core::relay;
use peer_scheduler_core::types::{NodeScore, PodKey};
use peer_scheduler_core::wire::proto::peer_scheduler_server::PeerScheduler;
use peer_scheduler_core::wire::proto::{PermitDecision, PodEnvelope, RelayAck, ScoreReport};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub struct PeerSchedulerService {
    pub dispatch: Arc<DispatchCore>,
    pub membership: Arc<MembershipView>,
    pub aggregator: Arc<ScoreAggregator>,
    pub metrics: Arc<dyn Metrics>,
    next_worker_index: AtomicUsize,
    worker_count: usize,
}

impl PeerSchedulerService {
    pub fn new(
        dispatch: Arc<DispatchCore>,
        membership: Arc<MembershipView>,
        aggregator: Arc<ScoreAggregator>,
        metrics: Arc<dyn Metrics>,
        worker_count: usize,
    ) -> Self {
        Self {
            dispatch,
            membership,
            aggregator,
            metrics,
            next_worker_index: AtomicUsize::new(0),
            worker_count: worker_count.max(1),
        }
    }

    fn next_worker(&self) -> usize {
        self.next_worker_index.fetch_add(1, Ordering::Relaxed) % self.worker_count
    }
}

type RelayAckStream = std::pin::Pin<Box<dyn futures::Stream<Item = Result<RelayAck, Status>> + Send>>;

#[tonic::async_trait]
impl PeerScheduler for PeerSchedulerService {
    type NewPodStream = RelayAckStream;

    async fn new_pod(
        &self,
        request: Request<Streaming<PodEnvelope>>,
    ) -> Result<Response<Self::NewPodStream>, Status> {
        let inbound = request.into_inner();
        let (ack_tx, ack_rx) = mpsc::channel(64);

        let dispatch = self.dispatch.clone();
        let worker_index = self.next_worker();

        tokio::spawn(relay::handle_inbound_stream(inbound, ack_tx, move |pod| {
            let dispatch = dispatch.clone();
            async move {
                dispatch.process_one(worker_index, pod).await;
            }
        }));

        let stream = ReceiverStream::new(ack_rx).map(Ok);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn collect_score(
        &self,
        request: Request<ScoreReport>,
    ) -> Result<Response<PermitDecision>, Status> {
        let report = request.into_inner();
        let key = PodKey::new(&report.namespace, &report.pod_name);
        let limit = self.membership.member_count_no_relays().await;

        let winner = self
            .aggregator
            .record_and_wait(
                &key,
                NodeScore {
                    node_name: report.node_name.clone(),
                    score: report.score as i64,
                },
                limit,
            )
            .await;

        let permit = report.score > 0 && winner.node_name == report.node_name;
        self.metrics.permit_decision(permit);
        Ok(Response::new(PermitDecision { permit }))
    }
}
