//! Integration tests for telemetry initialization and span helpers.

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // This may return Err if another test already installed one.
    let config = workpool::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "workpool-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = workpool::telemetry::init_telemetry(config);
}

#[test]
fn work_span_creates_and_records_transition() {
    let span = workpool::telemetry::work::start_work_span("mail", "job-1");
    workpool::telemetry::work::record_state_transition(&span, "due", "claimed");
    workpool::telemetry::work::record_state_transition(&span, "claimed", "completed");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;
    use workpool::telemetry::metrics;

    let labels = [KeyValue::new("work_type", "mail")];
    metrics::work_posted().add(1, &labels);
    metrics::work_claims().add(1, &labels);
    metrics::work_finalized().add(1, &labels);
    metrics::stuck_released().add(1, &labels);
    metrics::fastpath_published().add(1, &labels);
    metrics::work_duration_ms().record(12.5, &labels);
}
