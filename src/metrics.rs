//! Prometheus metrics for index writes, flushes, leases and queries
//!
//! # Example
//! ```no_run
//! use entity_index_sync::metrics;
//!
//! metrics::init_metrics().ok();
//! println!("{}", metrics::gather_metrics());
//! ```

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

const NAMESPACE: &str = "entity_index_sync";

lazy_static! {
    /// Registry holding every metric of this crate
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Write Metrics
    // ============================================================================

    /// Documents upserted
    ///
    /// Labels: index
    pub static ref SEARCH_DOCUMENTS_WRITTEN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("documents_written_total", "Documents upserted into an index")
            .namespace(NAMESPACE),
        &["index"]
    ).expect("Failed to create SEARCH_DOCUMENTS_WRITTEN_TOTAL metric");

    /// Documents deleted by id or field value
    ///
    /// Labels: index
    pub static ref SEARCH_DOCUMENTS_DELETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("documents_deleted_total", "Documents deleted from an index")
            .namespace(NAMESPACE),
        &["index"]
    ).expect("Failed to create SEARCH_DOCUMENTS_DELETED_TOTAL metric");

    /// Entities kept out of the index by an exclusion predicate
    ///
    /// Labels: index
    pub static ref SEARCH_DOCUMENTS_EXCLUDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("documents_excluded_total", "Entities excluded from an index")
            .namespace(NAMESPACE),
        &["index"]
    ).expect("Failed to create SEARCH_DOCUMENTS_EXCLUDED_TOTAL metric");

    /// Duration of one serialized write including commit
    ///
    /// Labels: index
    pub static ref SEARCH_WRITE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("write_duration_seconds", "Index write and commit duration in seconds")
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["index"]
    ).expect("Failed to create SEARCH_WRITE_DURATION_SECONDS metric");

    /// Unit-of-work flushes
    ///
    /// Labels: outcome (success, failure)
    pub static ref SEARCH_FLUSHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("flushes_total", "Unit-of-work flushes of buffered index changes")
            .namespace(NAMESPACE),
        &["outcome"]
    ).expect("Failed to create SEARCH_FLUSHES_TOTAL metric");

    // ============================================================================
    // Read Metrics
    // ============================================================================

    /// Searcher leases not yet released
    ///
    /// Labels: index
    pub static ref SEARCH_LEASES_OUTSTANDING: IntGaugeVec = IntGaugeVec::new(
        Opts::new("leases_outstanding", "Searcher leases not yet released")
            .namespace(NAMESPACE),
        &["index"]
    ).expect("Failed to create SEARCH_LEASES_OUTSTANDING metric");

    /// Searches executed
    ///
    /// Labels: kind (single, many)
    pub static ref SEARCH_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queries_total", "Searches executed")
            .namespace(NAMESPACE),
        &["kind"]
    ).expect("Failed to create SEARCH_QUERIES_TOTAL metric");

    /// Search duration in seconds
    ///
    /// Labels: kind (single, many)
    pub static ref SEARCH_QUERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("query_duration_seconds", "Search duration in seconds")
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["kind"]
    ).expect("Failed to create SEARCH_QUERY_DURATION_SECONDS metric");
}

/// Register every metric with [`PROMETHEUS_REGISTRY`]
///
/// Calling it again is harmless: metrics already registered are skipped.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SEARCH_DOCUMENTS_WRITTEN_TOTAL.clone()),
        Box::new(SEARCH_DOCUMENTS_DELETED_TOTAL.clone()),
        Box::new(SEARCH_DOCUMENTS_EXCLUDED_TOTAL.clone()),
        Box::new(SEARCH_WRITE_DURATION_SECONDS.clone()),
        Box::new(SEARCH_FLUSHES_TOTAL.clone()),
        Box::new(SEARCH_LEASES_OUTSTANDING.clone()),
        Box::new(SEARCH_QUERIES_TOTAL.clone()),
        Box::new(SEARCH_QUERY_DURATION_SECONDS.clone()),
    ];

    for collector in collectors {
        match PROMETHEUS_REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Prometheus text exposition of every registered metric
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}
