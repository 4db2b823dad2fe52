use once_cell::sync::Lazy;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

/// Time from resolve start to first discovered peer (spec §6).
pub static PEER_DISCOVERY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "peer_discovery_seconds",
        "Time from resolve start to first peer",
        &["peer"]
    )
    .unwrap()
});

/// Per-peer serve latency.
pub static PEER_RESPONSE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "peer_response_seconds",
        "Per-peer serve latency",
        &["peer", "key", "op"]
    )
    .unwrap()
});

pub static PEER_RESPONSE_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "peer_response_bytes",
        "Bytes served per peer",
        &["peer", "key", "op"]
    )
    .unwrap()
});
