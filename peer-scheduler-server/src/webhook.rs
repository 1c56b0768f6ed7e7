//! Admission webhook HTTP surface (§4.4, §6). A single `POST /validate`
//! route served over TLS via `axum-server`'s rustls acceptor. Always
//! responds `allowed: true` — this webhook exists to intercept pods for
//! intake, not to reject them — and only enqueues pods whose requested
//! scheduler name matches this instance.
//!
//! Grounded on the teacher's sibling `sem_os_server` crate: a thin
//! `axum::Router` plus an `AppError` that implements `IntoResponse` so
//! handlers can use `?` instead of manual status-code plumbing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use peer_scheduler_core::intake::IntakeQueue;
use peer_scheduler_core::types::Pod;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("malformed admission review: {0}")]
    Malformed(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Malformed(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub intake: IntakeQueue,
    pub scheduler_name: String,
}

/// Minimal `AdmissionReview` shape: only the fields this webhook reads
/// or writes, everything else round-trips through `extra`.
#[derive(Debug, Deserialize, Serialize)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub request: AdmissionRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub namespace: Option<String>,
    pub object: Value,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate", post(validate))
        .with_state(Arc::new(state))
}

async fn validate(
    State(state): State<Arc<WebhookState>>,
    Json(mut review): Json<AdmissionReview>,
) -> Result<Json<AdmissionReview>, AppError> {
    let uid = review.request.uid.clone();
    let pod = parse_pod(&review)?;

    // The response is always `allowed: true` (§4.4: this webhook exists
    // to intercept pods for intake, not to reject them) and must go out
    // before queueing completes, so a full queue backpressures the
    // enqueue task below rather than the admission response.
    review.response = Some(AdmissionResponse { uid, allowed: true });

    if let Some(pod) = pod {
        if pod.scheduler_name == state.scheduler_name {
            let intake = state.intake.clone();
            tokio::spawn(async move {
                if intake.enqueue(pod).await.is_err() {
                    tracing::warn!("intake queue closed; dropping admitted pod");
                }
            });
        }
    }

    Ok(Json(review))
}

fn parse_pod(review: &AdmissionReview) -> Result<Option<Pod>, AppError> {
    let object = &review.request.object;
    let Some(metadata) = object.get("metadata") else {
        return Ok(None);
    };
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Malformed("object.metadata.name missing".into()))?
        .to_string();
    let uid = metadata
        .get("uid")
        .and_then(Value::as_str)
        .unwrap_or(&review.request.uid)
        .to_string();
    let namespace = review
        .request
        .namespace
        .clone()
        .or_else(|| metadata.get("namespace").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    let spec = object
        .get("spec")
        .ok_or_else(|| AppError::Malformed("object.spec missing".into()))?;
    let scheduler_name = spec
        .get("schedulerName")
        .and_then(Value::as_str)
        .unwrap_or("default-scheduler")
        .to_string();

    Ok(Some(Pod {
        namespace,
        name,
        uid,
        scheduler_name,
        spec: serde_json::to_vec(spec).map_err(|e| AppError::Malformed(e.to_string()))?,
    }))
}

/// Serves the webhook router over TLS until `shutdown` resolves.
/// Certificate material is reloaded only at startup — a cert rotation
/// requires a pod restart, matching the teacher's preference for
/// simple, restart-driven config over live-reload machinery.
pub async fn serve(
    addr: SocketAddr,
    cert_dir: PathBuf,
    state: WebhookState,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let config = RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key")).await?;
    let app = router(state);

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
