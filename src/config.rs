use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MEASUREMENTS_DB: &str = "measurements.db";
const DEFAULT_SUMMARIES_DB: &str = "measurement-summaries.db";

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Keys accepted from the environment and from the setup file.
const SETTING_KEYS: [&str; 17] = [
    "HUB_MEASUREMENTS_DB",
    "HUB_SUMMARIES_DB",
    "HUB_HISTORY_PATH",
    "HUB_DB_POOL_SIZE",
    "HUB_STREAM_HOST",
    "HUB_STREAM_PORT",
    "HUB_STREAM_READ_TIMEOUT_SECS",
    "HUB_STREAM_BACKOFF_SECS",
    "HUB_STREAM_CLOSE_TIMEOUT_MS",
    "HUB_HTTP_HOST",
    "HUB_HTTP_PORT",
    "HUB_RAW_RETENTION_MINUTES",
    "HUB_ONLINE_ROLLUP",
    "HUB_BUFFER_URL",
    "HUB_COLLECTOR_CHECK_SECS",
    "HUB_COLLECTOR_ERROR_BACKOFF_SECS",
    "HUB_COLLECTOR_FETCH_TIMEOUT_SECS",
];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SettingValue {
    Flag(bool),
    Unsigned(u64),
    Text(String),
}

impl SettingValue {
    fn into_text(self) -> String {
        match self {
            SettingValue::Flag(flag) => flag.to_string(),
            SettingValue::Unsigned(n) => n.to_string(),
            SettingValue::Text(text) => text.trim().to_string(),
        }
    }
}

/// Setting lookup: the environment first, then the JSON object at
/// `HUB_SETUP_CONFIG_PATH`, keyed by the same names.
#[derive(Debug, Default)]
struct Settings {
    file: HashMap<String, String>,
}

impl Settings {
    fn load() -> Self {
        let file = non_empty_env("HUB_SETUP_CONFIG_PATH")
            .map(PathBuf::from)
            .and_then(|path| read_setup_file(&path))
            .unwrap_or_default();
        Self { file }
    }

    fn text(&self, key: &str) -> Option<String> {
        non_empty_env(key).or_else(|| self.file.get(key).cloned())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.text(key)?;
        match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable setting");
                None
            }
        }
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.text(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
}

fn read_setup_file(path: &Path) -> Option<HashMap<String, String>> {
    if !path.exists() {
        return None;
    }
    let mut bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read setup config; using env only");
            return None;
        }
    };
    let raw: HashMap<String, SettingValue> = match simd_json::serde::from_slice(&mut bytes) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse setup config; using env only");
            return None;
        }
    };
    Some(
        raw.into_iter()
            .filter_map(|(key, value)| {
                if !SETTING_KEYS.contains(&key.as_str()) {
                    tracing::warn!(path = %path.display(), key = %key, "unknown setup config key");
                    return None;
                }
                let value = value.into_text();
                (!value.is_empty()).then_some((key, value))
            })
            .collect(),
    )
}

#[derive(Clone, Debug)]
pub struct Config {
    pub measurements_db: PathBuf,
    pub summaries_db: PathBuf,
    pub history_path: Option<PathBuf>,
    pub db_pool_size: u32,
    pub stream_host: String,
    pub stream_port: u16,
    pub stream_read_timeout_secs: u64,
    pub stream_backoff_secs: u64,
    pub stream_close_timeout_ms: u64,
    pub http_host: String,
    pub http_port: u16,
    pub raw_retention_minutes: Option<u64>,
    pub online_rollup: bool,
    pub buffer_url: String,
    pub collector_check_secs: u64,
    pub collector_error_backoff_secs: u64,
    pub collector_fetch_timeout_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            measurements_db: PathBuf::from(DEFAULT_MEASUREMENTS_DB),
            summaries_db: PathBuf::from(DEFAULT_SUMMARIES_DB),
            history_path: None,
            db_pool_size: 4,
            stream_host: "localhost".to_string(),
            stream_port: 22222,
            stream_read_timeout_secs: 120,
            stream_backoff_secs: 5,
            stream_close_timeout_ms: 1000,
            http_host: "127.0.0.1".to_string(),
            http_port: 8000,
            raw_retention_minutes: None,
            online_rollup: true,
            buffer_url: "http://localhost:8000".to_string(),
            collector_check_secs: 30,
            collector_error_backoff_secs: 60,
            collector_fetch_timeout_secs: 30,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_settings(&Settings::load())
    }

    fn from_settings(settings: &Settings) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            measurements_db: settings
                .text("HUB_MEASUREMENTS_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.measurements_db),
            summaries_db: settings
                .text("HUB_SUMMARIES_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.summaries_db),
            history_path: settings.text("HUB_HISTORY_PATH").map(PathBuf::from),
            db_pool_size: settings.parsed("HUB_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size),
            stream_host: settings.text("HUB_STREAM_HOST").unwrap_or(defaults.stream_host),
            stream_port: settings.parsed("HUB_STREAM_PORT").unwrap_or(defaults.stream_port),
            stream_read_timeout_secs: settings
                .parsed("HUB_STREAM_READ_TIMEOUT_SECS")
                .unwrap_or(defaults.stream_read_timeout_secs),
            stream_backoff_secs: settings
                .parsed("HUB_STREAM_BACKOFF_SECS")
                .unwrap_or(defaults.stream_backoff_secs),
            stream_close_timeout_ms: settings
                .parsed("HUB_STREAM_CLOSE_TIMEOUT_MS")
                .unwrap_or(defaults.stream_close_timeout_ms),
            http_host: settings.text("HUB_HTTP_HOST").unwrap_or(defaults.http_host),
            http_port: settings.parsed("HUB_HTTP_PORT").unwrap_or(defaults.http_port),
            raw_retention_minutes: settings
                .parsed::<u64>("HUB_RAW_RETENTION_MINUTES")
                .filter(|v| *v != 0),
            online_rollup: settings
                .flag("HUB_ONLINE_ROLLUP")
                .unwrap_or(defaults.online_rollup),
            buffer_url: settings.text("HUB_BUFFER_URL").unwrap_or(defaults.buffer_url),
            collector_check_secs: settings
                .parsed("HUB_COLLECTOR_CHECK_SECS")
                .unwrap_or(defaults.collector_check_secs),
            collector_error_backoff_secs: settings
                .parsed("HUB_COLLECTOR_ERROR_BACKOFF_SECS")
                .unwrap_or(defaults.collector_error_backoff_secs),
            collector_fetch_timeout_secs: settings
                .parsed("HUB_COLLECTOR_FETCH_TIMEOUT_SECS")
                .unwrap_or(defaults.collector_fetch_timeout_secs),
            otlp_endpoint: non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        url::Url::parse(&config.buffer_url)
            .with_context(|| format!("HUB_BUFFER_URL is not a valid URL: {}", config.buffer_url))?;

        Ok(config)
    }

    pub fn stream_address(&self) -> String {
        format!("{}:{}", self.stream_host, self.stream_port)
    }

    pub fn http_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn stream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_read_timeout_secs)
    }

    pub fn stream_backoff(&self) -> Duration {
        Duration::from_secs(self.stream_backoff_secs)
    }

    pub fn stream_close_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_close_timeout_ms)
    }

    pub fn raw_retention(&self) -> Option<Duration> {
        self.raw_retention_minutes
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn collector_check_interval(&self) -> Duration {
        Duration::from_secs(self.collector_check_secs.max(1))
    }

    pub fn collector_error_backoff(&self) -> Duration {
        Duration::from_secs(self.collector_error_backoff_secs)
    }

    pub fn collector_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.collector_fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from(json: &str) -> Settings {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setup.json");
        std::fs::write(&path, json).unwrap();
        Settings {
            file: read_setup_file(&path).unwrap(),
        }
    }

    #[test]
    fn setup_file_fills_unset_values() {
        let settings = settings_from(
            r#"{"HUB_STREAM_HOST":" gateway.local ","HUB_STREAM_PORT":5000,"HUB_RAW_RETENTION_MINUTES":"1455","HUB_ONLINE_ROLLUP":false,"HUB_COLLECTOR_CHECK_SECS":"soon","stream_host":"ignored"}"#,
        );
        assert!(!settings.file.contains_key("stream_host"));

        let config = Config::from_settings(&settings).unwrap();
        assert_eq!(config.stream_address(), "gateway.local:5000");
        assert_eq!(config.raw_retention(), Some(Duration::from_secs(1455 * 60)));
        assert!(!config.online_rollup);
        assert_eq!(config.collector_check_secs, 30);
        assert_eq!(config.http_port, 8000);
    }

    #[test]
    fn invalid_buffer_url_is_rejected() {
        let settings = settings_from(r#"{"HUB_BUFFER_URL":"not a url"}"#);
        assert!(Config::from_settings(&settings).is_err());
    }

    #[test]
    fn unreadable_setup_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_setup_file(&path).is_none());
        assert!(read_setup_file(&dir.path().join("missing.json")).is_none());
    }
}
