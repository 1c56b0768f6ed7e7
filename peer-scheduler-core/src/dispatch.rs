//! C8 — Dispatch Core.
//!
//! Ties the rest of the core crate together for one pod: fan the pod
//! out to this peer's relay sub-members (C5, via C2's topology), run
//! it through the embedded scheduling engine locally (unless
//! relay-only), and wait — bounded by a deadline — for sub-schedulers
//! to acknowledge before returning the worker to the pool.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::engine::{DispatchHandle, SchedulingEngine};
use crate::intake::IntakeReceiver;
use crate::logging::SamplingFilter;
use crate::membership::MembershipView;
use crate::metrics::Metrics;
use crate::permit::ScoreClient;
use crate::relay::RelayClientPool;
use crate::topology::RelayTopology;
use crate::types::Pod;

/// Default scheduler-done channel depth (§4.8: "buffered (>= 4) so
/// late signals never block").
pub const SCHEDULER_DONE_BUFFER: usize = 4;

pub const DEFAULT_SUB_SCHEDULER_WAIT: Duration = Duration::from_secs(1);

/// Fires once `ceil(n * ratio)` completions are observed, or never if
/// `n == 0`. Waiters time out rather than block forever — §4.8 step 3
/// always pairs a wait with a fixed deadline.
pub struct CountdownLatch {
    state: Mutex<LatchState>,
    notify: Notify,
}

struct LatchState {
    done: usize,
    threshold: usize,
}

impl CountdownLatch {
    pub fn new(n: usize, ratio: f64) -> Self {
        let threshold = ((n as f64) * ratio.clamp(0.0, 1.0)).ceil() as usize;
        Self {
            state: Mutex::new(LatchState { done: 0, threshold }),
            notify: Notify::new(),
        }
    }

    /// Records one completion (ack received, or a send failure —
    /// §4.8's failure model auto-completes a peer's slot rather than
    /// stalling the rest of the dispatch on an unreachable sub-member).
    pub async fn done(&self) {
        let mut state = self.state.lock().await;
        state.done += 1;
        if state.done >= state.threshold {
            self.notify.notify_waiters();
        }
    }

    /// Waits for the threshold or `deadline`, whichever comes first.
    pub async fn wait(&self, deadline: Duration) {
        // `notified()` must be constructed before the state is checked
        // (and the lock released), not after — otherwise a `done()` call
        // landing in the gap between the check and the subscription is
        // missed and we fall through to the deadline instead of firing
        // promptly. Mirrors `EnginePool::pop`'s subscribe-then-check idiom.
        let notified = self.notify.notified();
        {
            let state = self.state.lock().await;
            if state.done >= state.threshold {
                return;
            }
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(deadline) => {}
        }
    }
}

/// Blocking LIFO pool of reusable scheduling engines (§4.8, §5 — mirrors
/// the teacher's mutex+condition convention for pool-like state).
pub struct EnginePool {
    engines: Mutex<VecDeque<Box<dyn SchedulingEngine>>>,
    notify: Notify,
}

impl EnginePool {
    pub fn new(engines: Vec<Box<dyn SchedulingEngine>>) -> Self {
        Self {
            engines: Mutex::new(engines.into_iter().collect()),
            notify: Notify::new(),
        }
    }

    pub async fn pop(&self) -> Box<dyn SchedulingEngine> {
        loop {
            let notified = self.notify.notified();
            {
                let mut engines = self.engines.lock().await;
                if let Some(engine) = engines.pop_back() {
                    return engine;
                }
            }
            notified.await;
        }
    }

    pub async fn push(&self, engine: Box<dyn SchedulingEngine>) {
        self.engines.lock().await.push_back(engine);
        self.notify.notify_one();
    }
}

/// Per-process wiring the dispatch core needs to run one pod through
/// relay, local scheduling, and the sub-scheduler wait.
pub struct DispatchCore {
    pub relay_pool: Arc<RelayClientPool>,
    pub topology: Arc<RelayTopology>,
    pub membership: Arc<MembershipView>,
    pub engines: Arc<EnginePool>,
    pub score_client: Arc<dyn ScoreClient>,
    pub relay_only: bool,
    pub sub_scheduler_wait_ratio: f64,
    pub sub_scheduler_wait_deadline: Duration,
    /// Down-samples the per-peer relay-send debug log, which fires once
    /// per sub-member per dispatch and would otherwise dominate
    /// debug-level output on a wide fan-out.
    pub relay_log_sampler: Arc<SamplingFilter>,
    pub metrics: Arc<dyn Metrics>,
}

impl DispatchCore {
    /// Runs the full per-pod pipeline: relay to this peer's own
    /// sub-members (empty at a leaf of the relay tree — `fan_out`
    /// no-ops there, so the same call is correct whether `pod` arrived
    /// from intake at the tree's root or from a parent peer further
    /// up), then schedule locally unless this instance is relay-only.
    #[tracing::instrument(skip(self, pod), fields(pod_key = %pod.key()))]
    pub async fn process_one(&self, worker_index: usize, pod: Pod) {
        let latch = self.fan_out(worker_index, &pod).await;

        if !self.relay_only {
            self.schedule_locally(pod).await;
        }

        if let Some(latch) = latch {
            latch.wait(self.sub_scheduler_wait_deadline).await;
        }
    }

    async fn fan_out(&self, worker_index: usize, pod: &Pod) -> Option<Arc<CountdownLatch>> {
        let sub_members = self.topology.sub_members(&self.membership).await;
        if sub_members.is_empty() {
            return None;
        }
        let latch = Arc::new(CountdownLatch::new(sub_members.len(), self.sub_scheduler_wait_ratio));

        for peer in sub_members {
            let pool = self.relay_pool.clone();
            let pod = pod.clone();
            let latch = latch.clone();
            let sampler = self.relay_log_sampler.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                match pool.send(&peer, worker_index, &pod).await {
                    Ok(done_rx) => {
                        if sampler.sample() {
                            tracing::debug!(peer = %peer.pod_name, "relayed pod");
                        }
                        metrics.relay_sent(&peer.pod_name);
                        let start = tokio::time::Instant::now();
                        // The receive loop drops the sender without
                        // firing it if the stream closes first — either
                        // way this resolves, and a genuine straggler is
                        // bounded by the caller's own deadline wait.
                        let _ = done_rx.await;
                        metrics.relay_ack_latency(&peer.pod_name, start.elapsed().as_millis() as u64);
                        latch.done().await;
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer.pod_name, error = %err, "relay send failed");
                        latch.done().await;
                    }
                }
            });
        }

        Some(latch)
    }

    async fn schedule_locally(&self, pod: Pod) {
        let mut engine = self.engines.pop().await;
        let (done_tx, mut done_rx) = mpsc::channel(SCHEDULER_DONE_BUFFER);
        let handle = DispatchHandle::new(done_tx);

        let engines = self.engines.clone();
        let score_client = self.score_client.clone();
        let membership = self.membership.clone();
        let pod_for_engine = pod.clone();
        let handle_for_failure = handle.clone();

        tokio::spawn(async move {
            if let Err(err) = engine.schedule_one(pod_for_engine, handle).await {
                tracing::warn!(error = %err, "local scheduling failed before permit");
                report_pre_permit_failure(&membership, &score_client, &pod, &handle_for_failure).await;
            }
            engines.push(engine).await;
        });

        done_rx.recv().await;
    }
}

/// On any pre-Permit failure, reports a zero score to this pod's
/// designated aggregator so the evaluator there doesn't stall waiting
/// on a peer that will never call `CollectScore`, and unblocks the
/// dispatcher waiting on the scheduler-done channel.
async fn report_pre_permit_failure(
    membership: &MembershipView,
    score_client: &Arc<dyn ScoreClient>,
    pod: &Pod,
    handle: &DispatchHandle,
) {
    handle.signal_done().await;
    let key = pod.key();
    match membership.target_for_scoring(&key).await {
        Some(target) => {
            score_client
                .collect_score(&target, &pod.namespace, &pod.name, "", 0)
                .await;
        }
        None => {
            tracing::warn!(error = %crate::error::SchedulerError::MembershipEmpty, pod = %key, "cannot report pre-permit failure");
        }
    }
}

/// Worker pool: `worker_count` long-lived tasks sharing one intake
/// receiver, each identified by a stable index 0..worker_count so its
/// relay streams (keyed by `(peer, worker_index)`, §4.5) never collide
/// with another worker's in-flight dispatch. The receiver is wrapped in
/// a mutex so several tasks can share the one `mpsc::Receiver` half
/// (§4.8 ambient note).
pub struct DispatchWorkers {
    core: Arc<DispatchCore>,
    intake: Arc<Mutex<IntakeReceiver>>,
    worker_count: usize,
}

impl DispatchWorkers {
    pub fn new(core: Arc<DispatchCore>, intake: IntakeReceiver, worker_count: usize) -> Self {
        Self {
            core,
            intake: Arc::new(Mutex::new(intake)),
            worker_count: worker_count.max(1),
        }
    }

    /// Spawns `worker_count` dispatcher tasks and waits for all of them
    /// to exit — either the intake queue closed, or `shutdown` fired
    /// and every worker finished the pod it had in flight.
    pub async fn run(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut handles = Vec::with_capacity(self.worker_count);
        for worker_index in 0..self.worker_count {
            let this = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let pod = tokio::select! {
                        pod = async {
                            let mut intake = this.intake.lock().await;
                            intake.recv().await
                        } => pod,
                        _ = shutdown.cancelled() => break,
                    };
                    let Some(pod) = pod else { break };
                    this.core.process_one(worker_index, pod).await;
                    this.core.metrics.dispatch_completed(worker_index);
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latch_with_zero_ratio_is_immediately_satisfied() {
        let latch = CountdownLatch::new(5, 0.0);
        latch.wait(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn latch_fires_on_ceil_threshold() {
        let latch = Arc::new(CountdownLatch::new(3, 0.5));
        // ceil(3*0.5) = 2
        latch.done().await;
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move {
                latch.wait(Duration::from_secs(5)).await;
            })
        };
        latch.done().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch should fire promptly on reaching threshold")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn latch_wait_honors_deadline_even_if_never_satisfied() {
        let latch = CountdownLatch::new(10, 1.0);
        latch.wait(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn engine_pool_round_trips_push_and_pop() {
        use crate::engine::test_support::StubEngine;
        let pool = EnginePool::new(vec![Box::new(StubEngine {
            node_name: "node-a".into(),
            score: 1,
        })]);
        let engine = pool.pop().await;
        pool.push(engine).await;
        let _engine = pool.pop().await;
    }
}
