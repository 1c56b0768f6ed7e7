//! Runtime configuration (§3.1). `clap` derive for CLI flags, each with
//! an environment-variable fallback via `#[arg(env = ...)]` — the same
//! pairing the teacher's server binary uses for its listen address.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

fn parse_duration_secs(s: &str) -> Result<Duration, std::num::ParseFloatError> {
    Ok(Duration::from_secs_f64(s.parse()?))
}

#[derive(Parser, Clone, Debug)]
#[command(name = "peer-scheduler", about = "Horizontally-scaled peer-to-peer pod scheduler")]
pub struct Config {
    /// This pod's own name, used to find itself in the sorted
    /// membership list. Normally the Kubernetes downward API.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: String,

    /// Namespace this peer and its Service/Endpoints live in.
    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: String,

    /// This pod's own IP, used to advertise the webhook endpoint when
    /// leader.
    #[arg(long, env = "POD_IP")]
    pub pod_ip: String,

    /// Name of the headless Service whose EndpointSlices define cluster
    /// membership (§4.1).
    #[arg(long, default_value = "peer-scheduler")]
    pub service_name: String,

    /// `schedulerName` this instance claims pods for.
    #[arg(long, default_value = "peer-scheduler")]
    pub scheduler_name: String,

    /// gRPC relay listen address (§6).
    #[arg(long, default_value = "0.0.0.0:50051")]
    pub grpc_listen_addr: String,

    /// Number of concurrent dispatch workers (§4.8).
    #[arg(long, default_value_t = 8)]
    pub worker_count: usize,

    /// Relay fan-out per peer (§4.2).
    #[arg(long, default_value_t = crate::topology::DEFAULT_FAN_OUT)]
    pub fan_out: usize,

    /// Ratio of sub-members the dispatcher waits for before proceeding
    /// (§4.8 "wait-for-subschedulers ratio"), in `[0.0, 1.0]`.
    #[arg(long, default_value_t = 1.0)]
    pub sub_scheduler_wait_ratio: f64,

    /// Deadline for the sub-scheduler wait.
    #[arg(long, value_parser = parse_duration_secs, default_value = "1.0")]
    pub sub_scheduler_wait_deadline: Duration,

    /// Quorum deadline for the score aggregator (§4.6).
    #[arg(long, value_parser = parse_duration_secs, default_value = "5.0")]
    pub aggregator_deadline: Duration,

    /// Tick interval for the leader-only node partitioner (§4.3).
    #[arg(long, value_parser = parse_duration_secs, default_value = "30.0")]
    pub partition_tick_interval: Duration,

    /// If true, this peer only relays and never runs the embedded
    /// scheduling engine locally.
    #[arg(long, default_value_t = false)]
    pub relay_only: bool,

    /// Debug flag: the permit plugin always denies (§4.7).
    #[arg(long, default_value_t = false)]
    pub permit_always_deny: bool,

    /// Use leader-watch pod intake instead of the admission webhook
    /// (§4.4).
    #[arg(long, default_value_t = false)]
    pub watch_pods: bool,

    /// Is this instance allowed to stand for leader election at all.
    #[arg(long, default_value_t = true)]
    pub leader_eligible: bool,

    /// Node label selector the partitioner scopes itself to, empty
    /// means all nodes.
    #[arg(long, default_value = "")]
    pub node_label_selector: String,

    /// Admission webhook bind address (§4.4, §6), only used when
    /// `watch_pods` is false.
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub webhook_bind_addr: String,

    /// Directory containing `tls.crt`/`tls.key` for the webhook.
    #[arg(long, default_value = "/etc/peer-scheduler/tls")]
    pub webhook_cert_dir: PathBuf,

    /// Allow running with zero visible peers by treating this instance
    /// as a singleton cluster (`ALLOW_SOLO`). Useful for local dev and
    /// the first peer up before any EndpointSlice exists.
    #[arg(long, env = "ALLOW_SOLO", default_value_t = false)]
    pub allow_solo: bool,

    /// Emit roughly 1-in-N log lines at debug level for inherently
    /// high-volume spans (generalizes the ad-hoc "request id ends in
    /// 00" sampling noted in §9's design notes).
    #[arg(long, default_value_t = 100)]
    pub log_sample_denominator: u32,

    /// Bound on outstanding intake items (§4.4: "bounded FIFO, capacity
    /// approx 10^6").
    #[arg(long, default_value_t = crate::intake::DEFAULT_QUEUE_DEPTH)]
    pub intake_queue_depth: usize,
}

impl Config {
    pub fn relay_port(&self) -> u16 {
        self.grpc_listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(crate::relay::DEFAULT_RELAY_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_required_args() {
        let config = Config::parse_from([
            "peer-scheduler",
            "--pod-name",
            "scheduler-0",
            "--pod-namespace",
            "default",
            "--pod-ip",
            "10.0.0.5",
        ]);
        assert_eq!(config.pod_name, "scheduler-0");
        assert_eq!(config.worker_count, 8);
        assert!(!config.allow_solo);
        assert_eq!(config.intake_queue_depth, crate::intake::DEFAULT_QUEUE_DEPTH);
    }

    #[test]
    fn relay_port_falls_back_to_default_on_unparsable_addr() {
        let mut config = Config::parse_from([
            "peer-scheduler",
            "--pod-name",
            "a",
            "--pod-namespace",
            "default",
            "--pod-ip",
            "10.0.0.5",
        ]);
        config.grpc_listen_addr = "not-an-addr".into();
        assert_eq!(config.relay_port(), crate::relay::DEFAULT_RELAY_PORT);
    }
}
