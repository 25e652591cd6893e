//! Process-wide `tracing` setup for applications embedding the client.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "jarvis-client.logs.jsonl";

#[derive(Clone, Debug, PartialEq, Eq)]
enum LogSink {
    Console,
    JsonFile { dir: PathBuf, file_name: String },
}

fn flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn sink_for(path: Option<&str>) -> LogSink {
    let Some(raw) = path.filter(|p| !p.trim().is_empty()) else {
        return LogSink::Console;
    };
    let path = Path::new(raw);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    LogSink::JsonFile { dir, file_name }
}

fn env_filter() -> EnvFilter {
    std::env::var("JARVIS_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Installs a global `tracing` subscriber. Later calls are no-ops, as is a
/// call made after another subscriber was installed.
///
/// - `JARVIS_OBSERVABILITY_ENABLED`: `false`/`0`/`off` skips setup.
/// - `JARVIS_LOG_LEVEL`, then `RUST_LOG`: filter directives (default `info`).
/// - `JARVIS_JSON_LOG_PATH`: write JSON lines to this file instead of
///   compact console output on stderr.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let enabled = std::env::var("JARVIS_OBSERVABILITY_ENABLED")
            .ok()
            .and_then(|v| flag(&v))
            .unwrap_or(true);
        if !enabled {
            return;
        }

        let path = std::env::var("JARVIS_JSON_LOG_PATH").ok();
        match sink_for(path.as_deref()) {
            LogSink::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(&dir);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(tracing_appender::rolling::never(dir, file_name));
                let _ = tracing_subscriber::registry()
                    .with(env_filter())
                    .with(layer)
                    .try_init();
            }
            LogSink::Console => {
                let layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(env_filter())
                    .with(layer)
                    .try_init();
            }
        }
    });
}
