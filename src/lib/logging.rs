use std::{
    env,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::{self, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::config::{LogFormat, LoggingConfig};

const LOG_DIR_ENV: &str = "BUCKETDB_LOG_DIR";
const LOG_PREFIX: &str = "bucketdb";
const MAX_RETAINED_LOGS: usize = 14;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static INITIALISED: OnceLock<()> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level; `BUCKETDB_LOG_DIR` over the configured directory.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if INITIALISED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Diagnostics go to stderr; stdout carries command output.
    let console_layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .boxed(),
    };

    let (file_layer, guard) = match resolve_log_dir(config.directory.as_deref())? {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix("log")
                .max_log_files(MAX_RETAINED_LOGS)
                .build(&dir)
                .with_context(|| format!("failed to open log directory {}", dir.display()))?;
            let (writer, guard) = non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    match subscriber.try_init() {
        Ok(_) => {
            let _ = INITIALISED.set(());
            if let Some(guard) = guard {
                let _ = FILE_GUARD.set(guard);
            }
            install_panic_hook();
        }
        Err(_) => {
            // Subscriber already installed elsewhere; drop guard so the worker thread exits.
            drop(guard);
        }
    }

    Ok(())
}

fn resolve_log_dir(configured: Option<&Path>) -> Result<Option<PathBuf>> {
    let candidate = match env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => match configured {
            Some(dir) => dir.to_path_buf(),
            None => return Ok(None),
        },
    };
    if candidate.is_absolute() {
        return Ok(Some(candidate));
    }
    let base = env::current_dir().context("failed to resolve current working directory")?;
    Ok(Some(base.join(candidate)))
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                tracing::error!(
                    target: "panic",
                    file = location.file(),
                    line = location.line(),
                    message = %info
                );
            } else {
                tracing::error!(target: "panic", message = %info);
            }
            default_hook(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_directories_resolve_against_cwd() {
        if env::var(LOG_DIR_ENV).is_ok() {
            return;
        }
        assert_eq!(resolve_log_dir(None).unwrap(), None);
        let resolved = resolve_log_dir(Some(Path::new("logs"))).unwrap().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("logs"));
    }
}
