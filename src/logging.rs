use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. Call once, before the server is
/// built. The level is controlled through `RUST_LOG`; the default is
/// `info`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
