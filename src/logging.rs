//! Process-wide tracing setup, shared by every subcommand.
//!
//! Mirrors the teacher's `init_logger`: JSON to stdout always, plus an
//! optional daily-rolling file appender for long-running init containers.

use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

const LOG_DIRECTORY: &str = "logs";
const LOG_FILE_NAME: &str = "image-prefetcher.log";
const LOG_FILE_HISTORY: usize = 5;

/// Guards returned must be held for the lifetime of the process, or the
/// non-blocking file writer stops flushing.
pub struct LoggingGuards {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize the global subscriber. `with_file_appender` is set for `fetch`
/// (a short-lived init container whose stdout may be lost) and unset for
/// `aggregate-metrics` (a long-lived pod whose stdout is scraped directly).
pub fn init(debug: bool, with_file_appender: bool) -> LoggingGuards {
    let level = if debug { Level::DEBUG } else { Level::INFO };

    let console_layer = Layer::new()
        .with_writer(std::io::stdout.with_max_level(level))
        .json();

    if !with_file_appender {
        Registry::default().with(console_layer).init();
        return LoggingGuards { _file_guard: None };
    }

    let condition = RollingConditionBasic::new().daily();
    std::fs::create_dir(LOG_DIRECTORY).unwrap_or_default();
    let log_path = std::path::Path::new(LOG_DIRECTORY).join(LOG_FILE_NAME);
    let file_appender = BasicRollingFileAppender::new(log_path, condition, LOG_FILE_HISTORY)
        .expect("failed to create rolling log file appender");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = Layer::new()
        .with_writer(file_writer.with_max_level(level))
        .json();

    Registry::default().with(console_layer).with(file_layer).init();

    LoggingGuards {
        _file_guard: Some(guard),
    }
}
