//! Test support. Initialises a tracing subscriber that cooperates with the
//! test harness's output capture; repeat calls are no-ops.

pub(crate) fn test_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
