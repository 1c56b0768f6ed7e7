use thiserror::Error;

/// Typed error surface for the core scheduling pipeline (§7 of the design doc).
///
/// Boundary code (cluster watchers, `main`) uses `anyhow::Result` and wraps
/// these with `.context(...)`; the core crate itself never reaches for
/// `anyhow` in its public API so callers can match on a specific kind.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("relay transport error contacting {peer}: {source}")]
    Transport {
        peer: String,
        #[source]
        source: tonic::Status,
    },

    #[error("local scheduling engine failed before permit: {0}")]
    LocalEngineFailure(String),

    #[error("no peers visible and solo mode is disabled")]
    MembershipEmpty,

    #[error("pod queue is shut down")]
    QueueClosed,

    #[error("fatal startup error: {0}")]
    Fatal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
