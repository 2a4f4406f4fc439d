use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "hangar.log";

/// Initialize the tracing/logging system.
///
/// Console output goes to stderr, human-readable or JSON depending on
/// `structured`. When `log_file` is given, a daily-rolling file layer is added
/// in the same format without ANSI colors. `RUST_LOG` overrides `log_level`.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init_logging(
    log_level: &str,
    log_file: Option<&Path>,
    structured: bool,
) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let (file_writer, guard) = match log_file {
        Some(path) => {
            let (dir, name) = split_log_path(path);
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, name));
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if structured {
        let console = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr);
        let file = file_writer.map(|w| {
            fmt::layer()
                .json()
                .with_target(true)
                .with_ansi(false)
                .with_writer(w)
        });
        registry.with(console).with(file).init();
    } else {
        let console = fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .with_writer(std::io::stderr);
        let file = file_writer.map(|w| {
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(w)
        });
        registry.with(console).with(file).init();
    }

    guard
}

fn split_log_path(path: &Path) -> (&Path, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    (dir, name)
}
