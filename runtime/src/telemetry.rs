use crate::error::RuntimeError;
use tracing_subscriber::EnvFilter;

/// Install a stdout `fmt` subscriber.
///
/// `RUST_LOG` wins over `directives` when set.
pub fn init_tracing(directives: &str) -> Result<(), RuntimeError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .map_err(|_| RuntimeError::Telemetry)
}

/// Like `init_tracing` with the default directives, ignoring a subscriber
/// that is already installed.
pub fn init_stdout_tracing() {
    let _ = init_tracing("info,flowline_core=debug");
}
