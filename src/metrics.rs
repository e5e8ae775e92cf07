//! Observability: OpenTelemetry metrics (feature `metrics`) and `tracing`
//! span helpers (feature `tracing`).

#[cfg(feature = "metrics")]
pub use self::otel::{BreakwaterMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};

    pub static METRICS: Lazy<BreakwaterMetrics> = Lazy::new(BreakwaterMetrics::init);

    pub struct BreakwaterMetrics {
        registry: Registry,
        _provider: SdkMeterProvider,
        pub statements_total: Counter<u64>,
        pub statement_duration: Histogram<f64>,
        pub statement_errors: Counter<u64>,
        pub commits_total: Counter<u64>,
        pub deferred_operations: Counter<u64>,
    }

    impl BreakwaterMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let mut builder = SdkMeterProvider::builder();
            match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => builder = builder.with_reader(exporter),
                Err(e) => log::warn!("prometheus exporter unavailable: {e}"),
            }
            let provider = builder.build();
            let meter = provider.meter("breakwater");

            let statements_total = meter
                .u64_counter("breakwater_statements_total")
                .with_description("Statements executed against SQL backends")
                .build();
            let statement_duration = meter
                .f64_histogram("breakwater_statement_duration_seconds")
                .with_description("Duration of statements")
                .build();
            let statement_errors = meter
                .u64_counter("breakwater_statement_errors_total")
                .with_description("Statements that returned an error")
                .build();
            let commits_total = meter
                .u64_counter("breakwater_commits_total")
                .with_description("Unit-of-work commits, by outcome")
                .build();
            let deferred_operations = meter
                .u64_counter("breakwater_deferred_operations")
                .with_description("Operations replayed by unit-of-work commits")
                .build();

            Self {
                registry,
                _provider: provider,
                statements_total,
                statement_duration,
                statement_errors,
                commits_total,
                deferred_operations,
            }
        }

        pub fn record_statement(&self, elapsed: std::time::Duration) {
            self.statements_total.add(1, &[]);
            self.statement_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_statement_error(&self) {
            self.statement_errors.add(1, &[]);
        }

        pub fn record_commit(&self, operations: usize, ok: bool) {
            let outcome = KeyValue::new("outcome", if ok { "committed" } else { "failed" });
            self.commits_total.add(1, &[outcome]);
            self.deferred_operations.add(operations as u64, &[]);
        }

        /// Prometheus text exposition of everything recorded so far
        pub fn render(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8_lossy(&buffer).into_owned()
        }
    }
}

/// Span constructors used around statements, transactions and commits
#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn execute_query_span(sql: &str) -> Span {
        info_span!("breakwater.execute", db.statement = sql)
    }

    pub fn begin_transaction_span(level: u32) -> Span {
        info_span!("breakwater.transaction.begin", level)
    }

    pub fn commit_transaction_span(level: u32) -> Span {
        info_span!("breakwater.transaction.commit", level)
    }

    pub fn rollback_transaction_span(level: u32) -> Span {
        info_span!("breakwater.transaction.rollback", level)
    }

    pub fn unit_of_work_commit_span(operations: usize) -> Span {
        info_span!("breakwater.unit_of_work.commit", operations)
    }

    pub fn relation_load_span(table: &str, relation: &str) -> Span {
        info_span!("breakwater.relation.load", table, relation)
    }
}

/// Install a `fmt` subscriber on the global registry.
///
/// Returns `false` when a global subscriber was already set.
#[cfg(feature = "tracing")]
pub fn init_subscriber() -> bool {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(all(test, feature = "tracing"))]
mod tests {
    use super::*;

    #[test]
    fn test_spans_can_be_entered_without_subscriber() {
        let _outer = tracing_helpers::unit_of_work_commit_span(3).entered();
        let _inner = tracing_helpers::execute_query_span("SELECT 1").entered();
    }

    #[test]
    fn test_init_subscriber_only_once() {
        let first = init_subscriber();
        assert!(!init_subscriber() || !first);
    }
}
