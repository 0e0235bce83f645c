use std::path::Path;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs console + daily rolling file logging.
///
/// `RUST_LOG` overrides `base_level`. Warnings and errors also go to stderr.
pub fn setup_logging(base_level: &str, log_dir: impl AsRef<Path>) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(base_level))?;

    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("aligner")
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        anyhow::bail!("Logging already initialized");
    }

    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(console_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::setup_logging;

    #[test]
    fn logging_is_installed_once() {
        let dir = std::env::temp_dir().join(format!("aligner_logs_{}", uuid::Uuid::new_v4()));
        setup_logging("debug", &dir).unwrap();
        tracing::info!("logging ready");
        assert!(dir.is_dir());
        assert!(setup_logging("info", &dir).is_err());
    }
}
