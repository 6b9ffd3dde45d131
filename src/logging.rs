/// File logging for the tracker.
///
/// Logs are stored in the data directory under `logs/`. Each run appends to
/// the same file, starting with a separator line.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "dice-stats.log";

/// Path of the log file inside `data_dir`.
pub fn log_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR).join(LOG_FILE)
}

/// Initializes logging for one run of the tracker.
///
/// Logs are written to `{data_dir}/logs/dice-stats.log`. `RUST_LOG` overrides
/// the default filter. `command` is recorded in the separator.
pub fn init_logging(data_dir: &Path, command: &str) -> Result<()> {
    let log_dir = data_dir.join(LOG_DIR);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dice_stats=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .ok(); // Already initialized

    let separator = format!(
        "\n{sep}\n[{ts}] dice-stats {command}\n{sep}\n",
        sep = "=".repeat(80),
        ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        command = command
    );

    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))
    {
        let _ = writeln!(file, "{}", separator);
    }

    tracing::info!("Logging initialized for command: {}", command);

    Ok(())
}
