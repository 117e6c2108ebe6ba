//! Prometheus metrics for chunkstore connectors.
//!
//! Defines metric name constants and installs a global Prometheus recorder
//! using `metrics-exporter-prometheus`.  Connectors record through the
//! `metrics` facade, so nothing is collected until a host installs a
//! recorder (or calls [`init_metrics`]).

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Blobs persisted by writes and compactions (counter). Labels: backend.
pub const BLOBS_WRITTEN_TOTAL: &str = "chunkstore_blobs_written_total";

/// Payload bytes accepted by `write_data` (counter). Labels: backend.
pub const BYTES_WRITTEN_TOTAL: &str = "chunkstore_bytes_written_total";

/// Payload bytes returned by reads (counter). Labels: backend.
pub const BYTES_READ_TOTAL: &str = "chunkstore_bytes_read_total";

/// Blobs removed by deletes and truncation (counter). Labels: backend.
pub const BLOBS_DELETED_TOTAL: &str = "chunkstore_blobs_deleted_total";

/// Partial deletes served by compaction (counter). Labels: backend.
pub const COMPACTIONS_TOTAL: &str = "chunkstore_compactions_total";

/// Metadata index rebuilds by full log scan (counter).
pub const INDEX_REBUILDS_TOTAL: &str = "chunkstore_index_rebuilds_total";

/// Caching decorator lookups answered from memory (counter). Labels: query.
pub const CACHE_HITS_TOTAL: &str = "chunkstore_cache_hits_total";

/// Caching decorator lookups forwarded to the backend (counter). Labels: query.
pub const CACHE_MISSES_TOTAL: &str = "chunkstore_cache_misses_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder on first call and return its
/// handle. Later calls return the same handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(BLOBS_WRITTEN_TOTAL, "Blobs persisted by writes and compactions");
    describe_counter!(BYTES_WRITTEN_TOTAL, "Bytes accepted by write_data");
    describe_counter!(BYTES_READ_TOTAL, "Bytes returned by reads");
    describe_counter!(BLOBS_DELETED_TOTAL, "Blobs removed by deletes and truncation");
    describe_counter!(COMPACTIONS_TOTAL, "Partial deletes served by compaction");
    describe_counter!(INDEX_REBUILDS_TOTAL, "Metadata index rebuilds by full log scan");
    describe_counter!(CACHE_HITS_TOTAL, "Caching decorator hits");
    describe_counter!(CACHE_MISSES_TOTAL, "Caching decorator misses");
}

// -- Tests --------------------------------------------------------------------
