use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const ENABLED_VAR: &str = "AGENT_RUN_OBSERVABILITY_ENABLED";
const LOG_LEVEL_VAR: &str = "AGENT_RUN_LOG_LEVEL";
const JSON_LOG_PATH_VAR: &str = "AGENT_RUN_JSON_LOG_PATH";
const DEFAULT_LOG_FILE: &str = "agent-run.logs.jsonl";
/// Targets whose events a bare level applies to; dependencies stay at `warn`.
const CLIENT_TARGETS: [&str; 2] = ["agent_run_client", "agent_run"];
const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn observability_enabled() -> bool {
    std::env::var(ENABLED_VAR)
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(true)
}

/// Expands a bare level (`debug`) into directives for the client's own
/// targets. Anything else is taken as a full filter expression.
fn client_directives(level: &str) -> String {
    let level = level.trim();
    if !LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        return level.to_string();
    }
    let mut directives = vec!["warn".to_string()];
    directives.extend(CLIENT_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

fn resolve_env_filter() -> EnvFilter {
    if let Ok(level) = std::env::var(LOG_LEVEL_VAR)
        && let Ok(filter) = EnvFilter::try_new(client_directives(&level))
    {
        return filter;
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(client_directives("info")))
}

/// Splits a log path into the directory and file name the appender expects.
fn log_file_target(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `AGENT_RUN_OBSERVABILITY_ENABLED`: optional enable/disable flag (default enabled).
/// - `AGENT_RUN_LOG_LEVEL`: optional level for the client's own events (`info`, `debug`, etc.;
///   dependencies stay at `warn`) or a full filter expression.
/// - `AGENT_RUN_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs go to stderr in a compact console format.
/// - `RUST_LOG`: fallback filter when `AGENT_RUN_LOG_LEVEL` is unset. Without either, the
///   client logs at `info` and dependencies at `warn`.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !observability_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        if let Ok(path_raw) = std::env::var(JSON_LOG_PATH_VAR) {
            let (dir, file_name) = log_file_target(Path::new(&path_raw));
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_flag_spellings() {
        assert_eq!(parse_bool_env(" Off "), Some(false));
        assert_eq!(parse_bool_env("enabled"), Some(true));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn bare_level_is_scoped_to_client_targets() {
        assert_eq!(
            client_directives(" debug "),
            "warn,agent_run_client=debug,agent_run=debug"
        );
        assert_eq!(client_directives("reqwest=trace"), "reqwest=trace");
        assert!(EnvFilter::try_new(client_directives("info")).is_ok());
    }

    #[test]
    fn bare_file_name_logs_to_current_dir() {
        assert_eq!(
            log_file_target(Path::new("run.jsonl")),
            (PathBuf::from("."), "run.jsonl".to_string())
        );
        assert_eq!(
            log_file_target(Path::new("logs/run.jsonl")),
            (PathBuf::from("logs"), "run.jsonl".to_string())
        );
    }
}
