//! Prometheus metrics for the consensus core.
//!
//! All metrics carry the "naxos_" prefix. The embedding node exposes the
//! encoded registry on its own diagnostics endpoint.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static METRICS: OnceLock<Metrics> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

pub struct Metrics {
    pub consensus_height: IntGauge,
    pub rounds_advanced: IntCounter,
    pub blocks_committed: IntCounter,

    pub msgs_received: IntCounter,
    pub msgs_dropped: IntCounter,

    pub proofs_emitted: IntCounter,
    pub proofs_suppressed: IntCounter,
    pub accusations_received: IntCounter,
    pub submissions_retried: IntCounter,
    pub submissions_failed: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    let _ = registry().register(Box::new(c.clone()));
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    let _ = registry().register(Box::new(g.clone()));
    g
}

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| Metrics {
        consensus_height: gauge("naxos_consensus_height", "current consensus height"),
        rounds_advanced: counter("naxos_rounds_advanced_total", "round changes past round 0"),
        blocks_committed: counter("naxos_blocks_committed_total", "blocks committed"),
        msgs_received: counter("naxos_msgs_received_total", "consensus payloads received"),
        msgs_dropped: counter("naxos_msgs_dropped_total", "consensus payloads dropped"),
        proofs_emitted: counter("naxos_proofs_emitted_total", "accountability proofs emitted"),
        proofs_suppressed: counter(
            "naxos_proofs_suppressed_total",
            "duplicate accountability proofs suppressed",
        ),
        accusations_received: counter(
            "naxos_accusations_received_total",
            "off-chain accusations received from peers",
        ),
        submissions_retried: counter(
            "naxos_submissions_retried_total",
            "evidence submissions retried after transient errors",
        ),
        submissions_failed: counter(
            "naxos_submissions_failed_total",
            "evidence submissions abandoned after exhausting retries",
        ),
    })
}

/// Text exposition of the whole registry.
pub fn gather_metrics() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&registry().gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
