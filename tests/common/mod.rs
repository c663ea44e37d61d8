use clutch_sim::SimFormat;

/// Initialize tracing from `RUST_LOG` for integration tests.
///
/// `try_init()` is idempotent: the first call in the process succeeds,
/// subsequent calls are silently ignored.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .try_init();
}
