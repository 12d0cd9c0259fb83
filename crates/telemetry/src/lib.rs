use tracing_subscriber::{fmt, EnvFilter};

pub mod logging;
pub mod metrics;

// Re-export commonly used items
pub use logging::{init_structured_logging, init_with_service, LogConfig, LogFormat};

/// Plain stderr logging for tests and small tools; safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init();
        init();
        tracing::info!("logging to stderr");
    }
}
