/// Metrics and telemetry for the read layer
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Hydration throughput and latency
/// - Loader batching effectiveness
/// - Result cache hit/miss rates
/// - Thread assembly cost
/// - Gate evaluation outcomes

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Encoder, Histogram,
    HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== Hydration Metrics ==========

    /// Hydration passes by viewer scope (authed vs public)
    pub static ref HYDRATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hydrations_total",
        "Total number of hydration passes",
        &["viewer_scope"]
    )
    .unwrap();

    /// Hydration pass duration in seconds
    pub static ref HYDRATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "hydration_duration_seconds",
        "Hydration pass latencies in seconds",
        &["viewer_scope"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap();

    // ========== Loader Metrics ==========

    /// Loader batch flushes by record kind
    pub static ref LOADER_BATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "loader_batches_total",
        "Total number of loader batch flushes",
        &["kind"]
    )
    .unwrap();

    /// Keys per loader batch flush
    pub static ref LOADER_BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "loader_batch_size",
        "Number of keys fetched per loader batch flush",
        &["kind"],
        vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]
    )
    .unwrap();

    // ========== Cache Metrics ==========

    /// Result cache hits by namespace
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_hits_total",
        "Total number of result cache hits",
        &["namespace"]
    )
    .unwrap();

    /// Result cache misses by namespace
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_misses_total",
        "Total number of result cache misses",
        &["namespace"]
    )
    .unwrap();

    /// Result cache backend failures by namespace (served as misses)
    pub static ref CACHE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_errors_total",
        "Total number of result cache backend failures",
        &["namespace"]
    )
    .unwrap();

    // ========== Thread Metrics ==========

    /// Thread views served, by source (cache vs assembled)
    pub static ref THREADS_SERVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "threads_served_total",
        "Total number of thread views served",
        &["source"]
    )
    .unwrap();

    /// Full thread assembly duration in seconds (cache misses only)
    pub static ref THREAD_ASSEMBLY_DURATION_SECONDS: Histogram = register_histogram!(
        "thread_assembly_duration_seconds",
        "Thread assembly latencies in seconds",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    /// Nodes per assembled thread
    pub static ref THREAD_SIZE_NODES: Histogram = register_histogram!(
        "thread_size_nodes",
        "Number of nodes in assembled threads",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    )
    .unwrap();

    // ========== Gate Metrics ==========

    /// Reply gate evaluations by verdict
    pub static ref GATE_EVALUATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gate_evaluations_total",
        "Total number of reply gate evaluations",
        &["verdict"]
    )
    .unwrap();

    // ========== Error Metrics ==========

    /// Errors by error type and module
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "errors_total",
        "Total number of errors",
        &["error_type", "module"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Record a hydration pass
pub fn record_hydration(authed: bool, duration: f64) {
    let scope = if authed { "authed" } else { "public" };
    HYDRATIONS_TOTAL.with_label_values(&[scope]).inc();
    HYDRATION_DURATION_SECONDS
        .with_label_values(&[scope])
        .observe(duration);
}

/// Record a loader batch flush
pub fn record_loader_batch(kind: &str, keys: usize) {
    LOADER_BATCHES_TOTAL.with_label_values(&[kind]).inc();
    LOADER_BATCH_SIZE
        .with_label_values(&[kind])
        .observe(keys as f64);
}

/// Record a result cache hit
pub fn record_cache_hit(namespace: &str) {
    CACHE_HITS_TOTAL.with_label_values(&[namespace]).inc();
}

/// Record a result cache miss
pub fn record_cache_miss(namespace: &str) {
    CACHE_MISSES_TOTAL.with_label_values(&[namespace]).inc();
}

/// Record a result cache backend failure
pub fn record_cache_error(namespace: &str) {
    CACHE_ERRORS_TOTAL.with_label_values(&[namespace]).inc();
}

/// Record a thread view served from cache
pub fn record_thread_cached() {
    THREADS_SERVED_TOTAL.with_label_values(&["cache"]).inc();
}

/// Record a thread view assembled from the store
pub fn record_thread_assembled(nodes: usize, duration: f64) {
    THREADS_SERVED_TOTAL.with_label_values(&["assembled"]).inc();
    THREAD_ASSEMBLY_DURATION_SECONDS.observe(duration);
    THREAD_SIZE_NODES.observe(nodes as f64);
}

/// Record a reply gate evaluation
pub fn record_gate_evaluation(verdict: &str) {
    GATE_EVALUATIONS_TOTAL.with_label_values(&[verdict]).inc();
}

/// Record an error
pub fn record_error(error_type: &str, module: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, module])
        .inc();
}
