//! Logging setup: routes `log` macros through tracing and installs a
//! formatted subscriber with an env-filter style directive string.

use tracing_subscriber::EnvFilter;

/// Initializes logging once. Safe to call repeatedly (later calls are
/// no-ops), which keeps tests and embedding applications simple.
pub fn init(filter: &str) {
    let _ = tracing_log::LogTracer::init();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("info");
        init("debug");
        log::info!("logging initialized");
    }
}
