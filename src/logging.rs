use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{Error, Result};

/// Daily log file: `<dir>/<name>_<YYYY-MM-DD>.log`.
pub fn log_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}_{}.log", Local::now().format("%Y-%m-%d")))
}

/// Logs to the console and appends to the daily log file.
/// Returns the path of the file being written.
pub fn init(dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let path = log_file_path(dir, name);
    let file = File::options().create(true).append(true).open(&path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing::info!("Log started: {}", path.display());
    Ok(path)
}
