//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` wins over `default_level`. Thread names are shown because
/// transfer completions are logged from the USB transfer threads.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Logging(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Logging(format!("Logging already initialised: {}", e)))?;

    Ok(())
}
