//! Tracing subscriber setup shared by the server and the CLI tools

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "hls_vault=info,axum=warn";

/// File written by the `local-logging` feature, inside [`resolve_log_dir`]
pub const LOG_FILE_NAME: &str = "backend.log";

pub fn local_logging_enabled() -> bool {
    cfg!(feature = "local-logging")
}

pub fn resolve_log_dir() -> Result<PathBuf, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Failed to resolve current directory: {e}"))?;
    Ok(cwd.join("log"))
}

/// `RUST_LOG` when set, otherwise `fallback` (or the crate default)
fn build_filter(fallback: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback.unwrap_or(DEFAULT_FILTER)))
}

fn init_stdout(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Install the global tracing subscriber.
///
/// `fallback_filter` is used when `RUST_LOG` is unset; repeated calls are ignored.
pub fn init_tracing(fallback_filter: Option<&str>) {
    let filter = build_filter(fallback_filter);

    #[cfg(feature = "local-logging")]
    {
        use std::sync::OnceLock;
        use tracing_appender::non_blocking::WorkerGuard;

        static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

        let log_dir = match resolve_log_dir() {
            Ok(dir) => dir,
            Err(err) => {
                eprintln!("{err}");
                return init_stdout(filter);
            }
        };
        if let Err(err) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Failed to create log directory: {err}");
            return init_stdout(filter);
        }

        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LOG_FILE_NAME));
        let _ = LOG_GUARD.set(guard);

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .try_init();
    }

    #[cfg(not(feature = "local-logging"))]
    init_stdout(filter);
}
