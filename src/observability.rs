//! Logging initialization and cluster traffic counters.

use crate::config::ObservabilityOptions;
use crate::error::{Result, RookeryError};
use metrics::counter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Kind label for intra-cluster message traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    Config,
    Slot,
    Channel,
    Unknown,
}

impl ClusterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::Config => "config",
            ClusterKind::Slot => "slot",
            ClusterKind::Channel => "channel",
            ClusterKind::Unknown => "unknown",
        }
    }
}

/// Initialize tracing. Honors `RUST_LOG` over the configured level.
pub fn init(opts: &ObservabilityOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&opts.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);
    if opts.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| RookeryError::Internal(format!("failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| RookeryError::Internal(format!("failed to init logging: {}", e)))?;
    }
    Ok(())
}

/// Record one inbound cluster message.
pub fn record_incoming(kind: ClusterKind, bytes: u64) {
    counter!("rookery_cluster_msg_incoming_count", "kind" => kind.as_str()).increment(1);
    counter!("rookery_cluster_msg_incoming_bytes", "kind" => kind.as_str()).increment(bytes);
}

/// Record one outbound cluster message.
pub fn record_outgoing(kind: ClusterKind, bytes: u64) {
    counter!("rookery_cluster_msg_outgoing_count", "kind" => kind.as_str()).increment(1);
    counter!("rookery_cluster_msg_outgoing_bytes", "kind" => kind.as_str()).increment(bytes);
}

/// Record a frame dropped on a saturated per-peer queue.
pub fn record_transport_drop(peer: u64) {
    counter!("rookery_transport_dropped_total", "peer" => peer.to_string()).increment(1);
}
