//! Embedded scheduling engine boundary (§1, §4.7, §9 design notes).
//!
//! The actual filter/score/bind decision logic is an external
//! collaborator — out of scope here, same as spec.md always treated it.
//! What belongs to this crate is the seam: a `SchedulingEngine` trait
//! modeled on the Kubernetes scheduler-framework's plugin stages (seen
//! across the retrieved pack's scheduler examples), and a typed
//! `DispatchHandle` the engine uses to signal back into C8 instead of
//! an ambient context value.

use async_trait::async_trait;

use crate::types::Pod;

/// What a local scheduling attempt concluded with, prior to permit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Node passed all filters with this local score.
    Feasible { node_name: String, score: i64 },
    /// No feasible node was found locally.
    Unschedulable,
}

/// Explicit channel the engine uses to tell C8 it has finished its
/// local (pre-permit) work, replacing an ambient context value per the
/// open design note: a pool-reused engine must not leak state into the
/// next pod it handles, so nothing about this handoff is stored on the
/// engine itself.
#[derive(Clone)]
pub struct DispatchHandle {
    pub(crate) scheduler_done: tokio::sync::mpsc::Sender<()>,
}

impl DispatchHandle {
    pub fn new(scheduler_done: tokio::sync::mpsc::Sender<()>) -> Self {
        Self { scheduler_done }
    }

    /// Signals C8 that local scheduling work is done — sent exactly
    /// once per dispatch, from whichever of three places reaches it
    /// first (§4.8): the permit plugin (prior to its RPC), the engine's
    /// own failure handler, or `schedule_one`'s return.
    pub async fn signal_done(&self) {
        let _ = self.scheduler_done.send(()).await;
    }
}

/// A reusable scheduling engine instance, pooled by C8 in a blocking
/// LIFO stack (§4.8). `schedule_one` owns the full filter → score →
/// permit → bind → post-bind pipeline for one pod; the permit stage is
/// implemented by this crate (`permit::PermitPlugin`), everything else
/// is the embedded engine's own business.
#[async_trait]
pub trait SchedulingEngine: Send + Sync {
    /// Runs the full pipeline for `pod`, signaling `handle` as soon as
    /// local (pre-permit) scheduling work completes — not when bind and
    /// post-bind finish, which may continue in the background.
    async fn schedule_one(&mut self, pod: Pod, handle: DispatchHandle) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Deterministic engine used by dispatch-core tests: always scores
    /// `node_name` for every pod and signals done immediately.
    pub struct StubEngine {
        pub node_name: String,
        pub score: i64,
    }

    #[async_trait]
    impl SchedulingEngine for StubEngine {
        async fn schedule_one(&mut self, _pod: Pod, handle: DispatchHandle) -> anyhow::Result<()> {
            handle.signal_done().await;
            Ok(())
        }
    }
}
