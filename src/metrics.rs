//! Metrics and tracing helpers
//!
//! Both halves are feature-gated: `metrics` records OpenTelemetry instruments
//! that a Prometheus exporter can scrape, `tracing` wraps evolve runs, scripts
//! and lock waits in spans.

#[cfg(feature = "metrics")]
use crate::evolution::Direction;
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
pub static METRICS: Lazy<EvolutionMetrics> = Lazy::new(EvolutionMetrics::init);

#[cfg(feature = "metrics")]
pub struct EvolutionMetrics {
    pub scripts_total: Counter<u64>,
    pub script_failures_total: Counter<u64>,
    pub script_duration: Histogram<f64>,
    pub lock_wait_duration: Histogram<f64>,
}

#[cfg(feature = "metrics")]
impl EvolutionMetrics {
    pub fn init() -> Self {
        let meter = global::meter("evolutions");

        let scripts_total = meter
            .u64_counter("evolutions_scripts_total")
            .with_description("Evolution scripts executed successfully")
            .build();

        let script_failures_total = meter
            .u64_counter("evolutions_script_failures_total")
            .with_description("Evolution scripts that failed and were marked inconsistent")
            .build();

        let script_duration = meter
            .f64_histogram("evolutions_script_duration_seconds")
            .with_description("Duration of a single evolution script")
            .build();

        let lock_wait_duration = meter
            .f64_histogram("evolutions_lock_wait_seconds")
            .with_description("Time spent waiting for the evolutions lock")
            .build();

        Self {
            scripts_total,
            script_failures_total,
            script_duration,
            lock_wait_duration,
        }
    }

    pub fn record_script(&self, direction: Direction, elapsed: Duration) {
        let attributes = [KeyValue::new("direction", direction.as_str())];
        self.scripts_total.add(1, &attributes);
        self.script_duration.record(elapsed.as_secs_f64(), &attributes);
    }

    pub fn record_failure(&self, direction: Direction) {
        self.script_failures_total
            .add(1, &[KeyValue::new("direction", direction.as_str())]);
    }

    pub fn observe_lock_wait(&self, elapsed: Duration) {
        self.lock_wait_duration.record(elapsed.as_secs_f64(), &[]);
    }
}

#[cfg(feature = "metrics")]
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to build prometheus exporter: {0}")]
    Exporter(String),
}

/// Install a Prometheus exporter as the global meter provider.
///
/// Must run before the first evolution so [`METRICS`] binds to this provider.
#[cfg(feature = "metrics")]
pub fn install_prometheus_exporter(registry: &prometheus::Registry) -> Result<(), MetricsError> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|e| MetricsError::Exporter(e.to_string()))?;

    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(exporter)
        .build();
    global::set_meter_provider(provider);

    Ok(())
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, info_span, Span};

    const MAX_STATEMENT_LEN: usize = 120;

    pub fn evolve_span(database: &str, meta_table: &str, operation: &str) -> Span {
        info_span!("evolutions.run", database, meta_table, operation)
    }

    pub fn script_span(revision: u32, direction: &str) -> Span {
        info_span!("evolutions.script", revision, direction)
    }

    pub fn lock_span(key: &str) -> Span {
        debug_span!("evolutions.lock", key)
    }

    pub fn transaction_span(action: &str) -> Span {
        debug_span!("evolutions.transaction", action)
    }

    pub fn statement_span(sql: &str) -> Span {
        let statement = truncate(sql);
        debug_span!("evolutions.statement", statement)
    }

    fn truncate(sql: &str) -> &str {
        match sql.char_indices().nth(MAX_STATEMENT_LEN) {
            Some((idx, _)) => &sql[..idx],
            None => sql,
        }
    }

}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_installed_exporter_collects_into_registry() {
        let registry = prometheus::Registry::new();
        install_prometheus_exporter(&registry).unwrap();

        global::meter("evolutions_exporter_test")
            .u64_counter("evolutions_exporter_test_runs")
            .build()
            .add(1, &[]);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("evolutions_exporter_test_runs"), "{text}");
    }
}
