//! Tracing setup: compact stdout output plus rotated text and JSON files.
//!
//! `RUST_LOG` controls filtering (default "info"), e.g.
//! `RUST_LOG=crawl_frontier=debug`.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber with three layers: a compact stdout
/// layer, a daily-rotated plain-text file (`crawl.log`), and a daily-rotated
/// JSON file (`crawl.json.log`) for structured analysis. File writers are
/// non-blocking so logging never stalls a worker.
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let text_appender = tracing_appender::rolling::daily(log_path, "crawl.log");
    let (text_writer, text_guard) = tracing_appender::non_blocking(text_appender);

    let json_appender = tracing_appender::rolling::daily(log_path, "crawl.json.log");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_appender);

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter.clone());

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_current_span(true)
        .with_filter(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?,
        );

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .init();

    // The non-blocking writers flush from a background thread only while
    // their guards live; leak them so they last the program's lifetime.
    Box::leak(Box::new(text_guard));
    Box::leak(Box::new(json_guard));

    tracing::info!(dir = %log_path.display(), "logging initialized");
    Ok(())
}

/// Convenience wrapper placing logs under `<data_dir>/logs`.
pub fn init_logging_in_data_dir<P: AsRef<Path>>(
    data_dir: P,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(data_dir.as_ref().join("logs"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    #[test]
    fn test_log_dir_creation() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs");

        // init_logging panics if a global subscriber is already set, so only
        // the directory handling is exercised here.
        std::fs::create_dir_all(&log_path).unwrap();
        assert!(log_path.exists());
    }
}
