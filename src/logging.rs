//! Telemetry initialization for the three log modes.

use std::path::Path;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogMode {
    Off,
    Console,
    File,
}

/// Install the global subscriber. The returned guard must live as long as
/// the process when file logging is active, or buffered lines are lost.
pub fn init(mode: LogMode, log_dir: &Path, level: &str) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
    };

    match mode {
        LogMode::Off => Ok(None),
        LogMode::Console => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .init();
            Ok(None)
        }
        LogMode::File => {
            let appender = tracing_appender::rolling::daily(log_dir, "shuttle.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
    }
}
