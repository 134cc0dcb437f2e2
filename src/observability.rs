use std::net::SocketAddr;

// ── Engine operations ───────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "seatd_bookings_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "seatd_cancellations_total";

/// Counter: waitlist entries converted into allocations.
pub const PROMOTIONS_TOTAL: &str = "seatd_promotions_total";

/// Counter: waitlist joins and leaves. Labels: op, outcome.
pub const WAITLIST_OPS_TOTAL: &str = "seatd_waitlist_ops_total";

/// Counter: invariant violations detected before a mutation.
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "seatd_invariant_violations_total";

// ── Read cache ──────────────────────────────────────────────────

/// Counter: cached view lookups. Labels: view, result (hit/miss/error).
pub const CACHE_REQUESTS_TOTAL: &str = "seatd_cache_requests_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatd_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const COMPACTIONS_TOTAL: &str = "seatd_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Label an operation result for metrics.
pub fn outcome<T>(result: &Result<T, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    }
}
