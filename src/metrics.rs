// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Realtime transport --------
pub static WS_CLIENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_clients", "connected realtime clients").unwrap());

pub static FRAMES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("frames_sent_total", "outbound realtime frames (labels: event, audience)"),
        &["event", "audience"],
    )
    .unwrap()
});

pub static FRAMES_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("frames_rejected_total", "inbound frames that failed to parse").unwrap()
});

pub static RECORDER_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("recorder_dropped_total", "frames not recorded because the recorder queue was full").unwrap()
});

// -------- Negotiation --------
pub static TRIPS_PROPOSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trips_proposed_total", "trips created from rider proposals").unwrap());

pub static TRIP_COUNTERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trip_counters_total", "persisted driver counter offers").unwrap());

pub static TRIPS_MATCHED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trips_matched_total", "trips matched at a final fare").unwrap());

pub static NEGOTIATION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("negotiation_failures_total", "negotiation steps aborted by a store failure"),
        &["action"],
    )
    .unwrap()
});

pub static NEGOTIATION_STALE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("negotiation_stale_total", "counter/accept against a trip no longer active"),
        &["action"],
    )
    .unwrap()
});

pub static ACTIVE_TRIPS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("active_trips", "trips currently negotiable").unwrap());

// -------- Fleet simulation --------
pub static FLEET_SIZE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("fleet_size", "drivers in the simulated fleet").unwrap());

pub static FLEET_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fleet_ticks_total", "fleet advance ticks").unwrap());

pub static FLEET_RESYNC_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fleet_resync_errors_total", "failed fleet resyncs").unwrap());

pub static DRIVER_PERSIST_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("driver_persist_errors_total", "driver position updates that failed").unwrap()
});

// -------- SLA monitor --------
pub static SLA_SCANS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("sla_scans_total", "SLA scan ticks").unwrap());

pub static SLA_SCAN_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("sla_scan_duration_ms", "SLA scan duration (ms)")).unwrap()
});

pub static ISSUES_OPENED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("issues_opened_total", "issues opened by type"), &["type"]).unwrap()
});

pub static ISSUE_DUPLICATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("issue_duplicates_total", "issue inserts rejected as already open"),
        &["type"],
    )
    .unwrap()
});

// -------- Gateways --------
pub static STORE_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("store_timeouts_total", "abandoned store calls"), &["op"]).unwrap()
});

pub static PUSH_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("push_results_total", "push deliveries (label: result)"),
        &["result"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_STORE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_store_mode", "store mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_PUSH_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_push_mode", "push mode (label: mode)"), &["mode"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(WS_CLIENTS.clone())),
        REGISTRY.register(Box::new(FRAMES_SENT.clone())),
        REGISTRY.register(Box::new(FRAMES_REJECTED.clone())),
        REGISTRY.register(Box::new(RECORDER_DROPPED.clone())),
        REGISTRY.register(Box::new(TRIPS_PROPOSED.clone())),
        REGISTRY.register(Box::new(TRIP_COUNTERS.clone())),
        REGISTRY.register(Box::new(TRIPS_MATCHED.clone())),
        REGISTRY.register(Box::new(NEGOTIATION_FAILURES.clone())),
        REGISTRY.register(Box::new(NEGOTIATION_STALE.clone())),
        REGISTRY.register(Box::new(ACTIVE_TRIPS.clone())),
        REGISTRY.register(Box::new(FLEET_SIZE.clone())),
        REGISTRY.register(Box::new(FLEET_TICKS.clone())),
        REGISTRY.register(Box::new(FLEET_RESYNC_ERRORS.clone())),
        REGISTRY.register(Box::new(DRIVER_PERSIST_ERRORS.clone())),
        REGISTRY.register(Box::new(SLA_SCANS.clone())),
        REGISTRY.register(Box::new(SLA_SCAN_MS.clone())),
        REGISTRY.register(Box::new(ISSUES_OPENED.clone())),
        REGISTRY.register(Box::new(ISSUE_DUPLICATES.clone())),
        REGISTRY.register(Box::new(STORE_TIMEOUTS.clone())),
        REGISTRY.register(Box::new(PUSH_RESULTS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_STORE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_PUSH_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}
