//! Logging & diagnostics (C11): structured, leveled logging to the
//! console and to a daily-rotated file under the log root, with
//! per-module targets (`sheetwatch::watch`, `sheetwatch::queue`,
//! `sheetwatch::parser`, …) so operators can filter by subsystem.

use std::path::Path;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{ErrorKind, Result};

/// Holds the non-blocking file writer's flush guard; keep this alive for
/// the lifetime of the process, dropping it flushes pending log lines.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initializes the global tracing subscriber: console output plus a
/// daily-rotated file under `log_root/sheetwatch.log.<date>`. `level` is
/// a directive string (e.g. `"info"`, `"sheetwatch::parser=debug"`) used
/// only when `RUST_LOG` is unset.
pub fn init(log_root: &Path, level: &str) -> Result<LoggingGuard> {
    std::fs::create_dir_all(log_root).map_err(|e| ErrorKind::Io { path: log_root.to_path_buf(), source: e })?;

    let file_appender = tracing_appender::rolling::daily(log_root, "sheetwatch.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer().with_target(true);
    let file_layer = fmt::layer().with_writer(nb_writer).with_ansi(false).with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ErrorKind::ConfigError(format!("failed to initialize logging: {e}")))?;

    install_panic_hook();

    Ok(LoggingGuard { _file_guard: guard })
}

/// Logs the panic payload at `error` before the isolated-parser boundary
/// (§4.2) converts it into `ErrorKind::ParserCrashed`. Installed once.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "sheetwatch::parser", panic = %info, "worker_thread_panic");
            default_panic(info);
        }));
    });
}

/// Logs a C7 worker's one-line per-file result at the level its tag
/// implies: `info` for `OK`/`SKIP`, `warn` for `TIMEOUT`, `error`
/// otherwise.
pub fn log_compare_result(path: &Path, sequence: u64, tag: &str, detail: Option<&str>) {
    let file = path.display().to_string();
    let detail = detail.unwrap_or("");
    match tag {
        "OK" | "SKIP" => {
            tracing::info!(target: "sheetwatch::queue", file = %file, sequence, tag, detail, "compare_result")
        }
        "TIMEOUT" => {
            tracing::warn!(target: "sheetwatch::queue", file = %file, sequence, tag, detail, "compare_result")
        }
        _ => tracing::error!(target: "sheetwatch::queue", file = %file, sequence, tag, detail, "compare_result"),
    }
}
