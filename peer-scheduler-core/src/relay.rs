//! C5 — Relay Transport.
//!
//! One persistent bidirectional `NewPod` stream per `(destination pod,
//! worker index)` pair, keyed so that concurrent dispatch workers never
//! share a stream and block each other's acks. The pod's `PodEnvelope`
//! is built once per dispatch (`wire::encode_pod_envelope`'s typed
//! equivalent, see below) and each destination gets its own
//! `request_id` stamped into a cheap clone — a real copy of the pod
//! bytes, not the byte-patched zero-copy path `wire.rs` documents and
//! tests in isolation, but behaviorally identical and far simpler to
//! keep correct across a tonic-generated client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tonic::transport::Endpoint as TonicEndpoint;
use tonic::Streaming;

use crate::error::{Result, SchedulerError};
use crate::types::{Endpoint, Pod};
use crate::wire::proto::peer_scheduler_client::PeerSchedulerClient;
use crate::wire::proto::{PodEnvelope, PodMessage, RelayAck};

/// Default TCP port peers dial each other on (§6, no TLS by default —
/// relay traffic never leaves the cluster network).
pub const DEFAULT_RELAY_PORT: u16 = 50051;

struct StreamHandle {
    requests: mpsc::Sender<PodEnvelope>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>>,
}

/// Pool of outbound relay streams, one per `(peer pod name, worker
/// index)`. Shared across all dispatch workers of a single process.
pub struct RelayClientPool {
    streams: Mutex<HashMap<(String, usize), StreamHandle>>,
    next_request_id: AtomicU32,
}

impl Default for RelayClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClientPool {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
        }
    }

    /// Sends `pod` to `peer` on the stream owned by `worker_index`,
    /// opening it on first use. Returns a receiver that resolves once
    /// the peer's `RelayAck` arrives; the caller (C8's countdown latch)
    /// applies its own deadline — a receiver that never resolves (peer
    /// gone, stream dropped) is the caller's problem to time out, not
    /// this pool's.
    pub async fn send(
        &self,
        peer: &Endpoint,
        worker_index: usize,
        pod: &Pod,
    ) -> Result<oneshot::Receiver<()>> {
        let key = (peer.pod_name.clone(), worker_index);
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let envelope = PodEnvelope {
            request_id,
            pod: Some(PodMessage {
                namespace: pod.namespace.clone(),
                name: pod.name.clone(),
                uid: pod.uid.clone(),
                scheduler_name: pod.scheduler_name.clone(),
                spec: pod.spec.clone(),
            }),
        };

        let (done_tx, done_rx) = oneshot::channel();

        loop {
            let handle_exists = {
                let mut streams = self.streams.lock().await;
                if let Some(handle) = streams.get(&key) {
                    handle.pending.lock().await.insert(request_id, done_tx);
                    if handle.requests.send(envelope.clone()).await.is_ok() {
                        return Ok(done_rx);
                    }
                    streams.remove(&key);
                    false
                } else {
                    false
                }
            };

            if handle_exists {
                continue;
            }

            let address = peer
                .primary_address()
                .ok_or_else(|| SchedulerError::Transport {
                    peer: peer.pod_name.clone(),
                    source: tonic::Status::unavailable("peer has no address yet"),
                })?;
            self.open_stream(&key, address).await?;

            let mut streams = self.streams.lock().await;
            if let Some(handle) = streams.get(&key) {
                handle.pending.lock().await.insert(request_id, done_tx);
                if handle.requests.send(envelope).await.is_ok() {
                    return Ok(done_rx);
                }
            }
            streams.remove(&key);
            return Err(SchedulerError::Transport {
                peer: peer.pod_name.clone(),
                source: tonic::Status::unavailable("stream closed immediately after opening"),
            });
        }
    }

    async fn open_stream(&self, key: &(String, usize), address: &str) -> Result<()> {
        let uri = format!("http://{address}:{DEFAULT_RELAY_PORT}");
        let channel = TonicEndpoint::from_shared(uri.clone())
            .map_err(|e| SchedulerError::Transport {
                peer: key.0.clone(),
                source: tonic::Status::invalid_argument(e.to_string()),
            })?
            .connect()
            .await
            .map_err(|e| SchedulerError::Transport {
                peer: key.0.clone(),
                source: tonic::Status::unavailable(e.to_string()),
            })?;

        let mut client = PeerSchedulerClient::new(channel);
        let (tx, rx) = mpsc::channel::<PodEnvelope>(64);
        let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);

        let response = client
            .new_pod(outbound)
            .await
            .map_err(|status| SchedulerError::Transport {
                peer: key.0.clone(),
                source: status,
            })?;

        let pending: Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        spawn_receive_loop(response.into_inner(), pending.clone());

        let mut streams = self.streams.lock().await;
        streams.insert(
            key.clone(),
            StreamHandle {
                requests: tx,
                pending,
            },
        );
        Ok(())
    }
}

fn spawn_receive_loop(
    mut inbound: Streaming<RelayAck>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>>,
) {
    tokio::spawn(async move {
        loop {
            match inbound.message().await {
                Ok(Some(ack)) => {
                    let done = pending.lock().await.remove(&ack.request_id);
                    match done {
                        Some(tx) => {
                            let _ = tx.send(());
                        }
                        None => {
                            tracing::debug!(request_id = ack.request_id, "ack for unknown request");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "relay receive stream failed");
                    break;
                }
            }
        }
        // Remaining pending latches stay un-done; the dispatch-side
        // deadline (§4.8) releases them.
    });
}

/// Server-side handler for the `NewPod` RPC: acks every inbound
/// envelope on `request_id` and forwards the decoded pod to `on_pod`.
/// Lives here rather than in the server crate because C5 (the relay
/// transport, both directions) is a core component, not a boundary
/// collaborator.
pub async fn handle_inbound_stream<F, Fut>(
    mut inbound: Streaming<PodEnvelope>,
    ack_tx: mpsc::Sender<RelayAck>,
    on_pod: F,
) where
    F: Fn(Pod) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        match inbound.message().await {
            Ok(Some(envelope)) => {
                let request_id = envelope.request_id;
                if let Some(msg) = envelope.pod {
                    on_pod(Pod {
                        namespace: msg.namespace,
                        name: msg.name,
                        uid: msg.uid,
                        scheduler_name: msg.scheduler_name,
                        spec: msg.spec,
                    })
                    .await;
                }
                if ack_tx.send(RelayAck { request_id }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "inbound relay stream failed");
                break;
            }
        }
    }
}
