use std::net::SocketAddr;

// ── Ledger operations ───────────────────────────────────────────

/// Counter: booking lifecycle operations. Labels: op, outcome.
pub const BOOKING_OPS_TOTAL: &str = "coachbook_booking_ops_total";

/// Histogram: time spent waiting for coach/student row locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "coachbook_lock_wait_seconds";

/// Counter: row lock acquisitions that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "coachbook_lock_timeouts_total";

/// Counter: course-credit movements. Labels: kind.
pub const CREDIT_MOVEMENTS_TOTAL: &str = "coachbook_credit_movements_total";

/// Counter: energy postings. Labels: kind, outcome.
pub const ENERGY_POSTINGS_TOTAL: &str = "coachbook_energy_postings_total";

/// Counter: CAS attempts lost to a concurrent writer.
pub const ENERGY_CAS_RETRIES_TOTAL: &str = "coachbook_energy_cas_retries_total";

/// Counter: memberships flipped to expired by the reaper.
pub const MEMBERSHIPS_EXPIRED_TOTAL: &str = "coachbook_memberships_expired_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "coachbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "coachbook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "coachbook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for an error outcome.
pub fn outcome_label(result: &Result<impl Sized, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    }
}
