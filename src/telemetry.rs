use tracing_subscriber::EnvFilter;

/// Install the JSON log subscriber shared by every binary. `RUST_LOG`
/// overrides the default `info` filter.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}
