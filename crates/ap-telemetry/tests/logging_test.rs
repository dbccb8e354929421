use ap_telemetry::logging::{self, LogFormat};

#[test]
fn second_init_is_a_noop() {
    // Only one of these can install the global subscriber.
    let first = logging::init_logging("test-service", "debug");
    let second = logging::init_logging_json("test-service-json", "info");
    assert!(!(first && second));
    assert!(!logging::init("test-service", LogFormat::Human, "warn"));

    tracing::info!(key = "value", "log line after init");
}

#[test]
fn bad_default_level_does_not_panic() {
    logging::init("fallback-test", LogFormat::Json, "not a [valid filter");
}
