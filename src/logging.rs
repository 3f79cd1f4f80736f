//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log.level`. Logs go to `log.file` when set and to
/// stderr otherwise, so stdout only carries command output. Keep the
/// returned guard alive until exit or buffered file logs are lost.
pub fn init(log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&log.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", log.level, e))?;

  let (layer, guard) = match &log.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      (
        fmt::layer().with_writer(writer).with_ansi(false).with_target(true).boxed(),
        Some(guard),
      )
    }
    None => (
      fmt::layer().with_writer(std::io::stderr).compact().with_target(true).boxed(),
      None,
    ),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
