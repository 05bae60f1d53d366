use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::terminal::output::{DEFAULT_OUTPUT_CHARACTER_LIMIT, DEFAULT_OUTPUT_LINE_LIMIT};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub default_shell: Option<String>,
    pub default_cwd: PathBuf,

    // Output shaping
    pub output_line_limit: usize,
    pub output_character_limit: usize,
    pub compress_progress_bar: bool,

    // Command completion
    pub command_timeout: Duration,
    pub compound_wait: Duration,
    pub completion_markers_enabled: bool,
    pub completion_markers_use_nonce: bool,
    pub completion_detection_timeout: Duration,
    pub completion_poll_interval: Duration,
    pub custom_prompt_patterns: Vec<String>,

    // Services
    pub service_log_capacity: usize,
    pub health_check_interval: Duration,
    pub service_stop_timeout: Duration,
    pub service_stop_poll_interval: Duration,
    pub failed_service_cleanup_delay: Duration,

    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        let default_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let audit_log_file = default_cwd.join(".agent-shell").join("commands.log");
        Config {
            log_level: "info".to_string(),
            default_shell: None,
            default_cwd,
            output_line_limit: DEFAULT_OUTPUT_LINE_LIMIT,
            output_character_limit: DEFAULT_OUTPUT_CHARACTER_LIMIT,
            compress_progress_bar: true,
            command_timeout: Duration::from_millis(15_000),
            compound_wait: Duration::from_millis(10_000),
            completion_markers_enabled: true,
            completion_markers_use_nonce: true,
            completion_detection_timeout: Duration::from_millis(300_000),
            completion_poll_interval: Duration::from_millis(100),
            custom_prompt_patterns: Vec::new(),
            service_log_capacity: 1000,
            health_check_interval: Duration::from_millis(1000),
            service_stop_timeout: Duration::from_millis(10_000),
            service_stop_poll_interval: Duration::from_millis(100),
            failed_service_cleanup_delay: Duration::from_millis(5 * 60 * 1000),
            audit_log_file,
            audit_log_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

fn expand_tilde(path_str: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {}: {}", key, raw)),
        _ => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let default_cwd = match std::env::var("DEFAULT_CWD") {
            Ok(raw) if !raw.is_empty() => {
                let expanded = expand_tilde(&raw)?;
                let canonical = dunce::canonicalize(&expanded)
                    .with_context(|| format!("Failed to canonicalize DEFAULT_CWD: {}", raw))?;
                if !canonical.is_dir() {
                    anyhow::bail!("DEFAULT_CWD is not a valid directory: {:?}", canonical);
                }
                canonical
            }
            _ => defaults.default_cwd.clone(),
        };

        let default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.is_empty());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let custom_prompt_patterns = std::env::var("CUSTOM_PROMPT_PATTERNS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let service_log_capacity = env_parse("SERVICE_LOG_CAPACITY", defaults.service_log_capacity)?;
        if service_log_capacity == 0 {
            warn!("SERVICE_LOG_CAPACITY is 0; service logs will not be retained.");
        }

        let audit_log_file = match std::env::var("AUDIT_LOG_FILE") {
            Ok(raw) if !raw.is_empty() => expand_tilde(&raw)?,
            _ => default_cwd.join(".agent-shell").join("commands.log"),
        };
        let audit_log_max_size_bytes = env_parse("AUDIT_LOG_MAX_SIZE_MB", 10u64)? * 1024 * 1024;

        Ok(Config {
            log_level,
            default_shell,
            default_cwd,
            output_line_limit: env_parse("TERMINAL_OUTPUT_LINE_LIMIT", defaults.output_line_limit)?,
            output_character_limit: env_parse(
                "TERMINAL_OUTPUT_CHARACTER_LIMIT",
                defaults.output_character_limit,
            )?,
            compress_progress_bar: env_parse(
                "TERMINAL_COMPRESS_PROGRESS_BAR",
                defaults.compress_progress_bar,
            )?,
            command_timeout: env_millis("COMMAND_TIMEOUT_MS", defaults.command_timeout)?,
            compound_wait: env_millis("COMPOUND_WAIT_MS", defaults.compound_wait)?,
            completion_markers_enabled: env_parse(
                "COMPLETION_MARKERS_ENABLED",
                defaults.completion_markers_enabled,
            )?,
            completion_markers_use_nonce: env_parse(
                "COMPLETION_MARKERS_USE_NONCE",
                defaults.completion_markers_use_nonce,
            )?,
            completion_detection_timeout: env_millis(
                "COMPLETION_DETECTION_TIMEOUT_MS",
                defaults.completion_detection_timeout,
            )?,
            completion_poll_interval: env_millis(
                "COMPLETION_POLL_INTERVAL_MS",
                defaults.completion_poll_interval,
            )?,
            custom_prompt_patterns,
            service_log_capacity,
            health_check_interval: env_millis("HEALTH_CHECK_INTERVAL_MS", defaults.health_check_interval)?,
            service_stop_timeout: env_millis("SERVICE_STOP_TIMEOUT_MS", defaults.service_stop_timeout)?,
            service_stop_poll_interval: env_millis(
                "SERVICE_STOP_POLL_MS",
                defaults.service_stop_poll_interval,
            )?,
            failed_service_cleanup_delay: env_millis(
                "FAILED_SERVICE_CLEANUP_MS",
                defaults.failed_service_cleanup_delay,
            )?,
            audit_log_file,
            audit_log_max_size_bytes,
        })
    }
}
