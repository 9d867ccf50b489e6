use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with environment variable support.
/// Reads the MAESTRO_LOG environment variable (standard env-filter syntax),
/// defaulting to `info`. Safe to call more than once; later calls are no-ops.
pub fn init_logger() {
    let filter = EnvFilter::try_from_env("MAESTRO_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
