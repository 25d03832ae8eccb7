use crate::config::LoggingConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize logging from configuration.
///
/// Stdout always; a daily rotating `gateway.log` when `log_to_file` is set.
/// `RUST_LOG` overrides the configured level. Keep the returned guard alive
/// for the life of the process so buffered file output is flushed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let json = config.log_format == "json";

    let stdout_layer = if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_line_number(false)
            .boxed()
    };

    let (file_layer, guard) = if config.log_to_file {
        let log_dir = log_dir(config);
        std::fs::create_dir_all(&log_dir)?;

        let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "gateway.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = if json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        level = %config.level,
        format = %config.log_format,
        to_file = config.log_to_file,
        "Logging initialized"
    );

    Ok(guard)
}

fn log_dir(config: &LoggingConfig) -> PathBuf {
    if config.log_dir.trim().is_empty() {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".punch-gateway")
            .join("logs")
    } else {
        PathBuf::from(&config.log_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_resolution() {
        let mut config = LoggingConfig::default();
        assert!(log_dir(&config).ends_with(".punch-gateway/logs"));

        config.log_dir = "/var/log/gateway".into();
        assert_eq!(log_dir(&config), PathBuf::from("/var/log/gateway"));
    }
}
