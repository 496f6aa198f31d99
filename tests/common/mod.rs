use tracing_subscriber::{fmt::format::FmtSpan, fmt::SubscriberBuilder, util::SubscriberInitExt, EnvFilter};

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn setup_log() {
    let _ = SubscriberBuilder::default()
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish()
        .try_init();
}
