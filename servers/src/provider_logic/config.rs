use anyhow::{Context, Result};
use clap::Parser;
use lib_session::dictionary::DataDictionary;
use lib_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_provider.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Interactive market data provider (websocket session front end)", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PROVIDER_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "PROVIDER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PROVIDER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PROVIDER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PROVIDER_SESSION_CONFIG", help = "Path to the session settings file (capacities, sizes, timers).")]
    pub session_config_path: Option<PathBuf>,

    #[clap(long, env = "PROVIDER_DICTIONARY_PATH", help = "Path to a JSON data dictionary. The built-in dictionary is used when unset.")]
    pub dictionary_path: Option<PathBuf>,

    #[clap(long, env = "PROVIDER_CHANNEL_BUFFER_BYTES", help = "Outbound bytes a single client may have in flight before sends are deferred.")]
    pub channel_buffer_bytes: Option<u64>,

    #[clap(long, env = "PROVIDER_STATS_INTERVAL_SECONDS", help = "Interval in seconds between session statistics log lines.")]
    pub stats_interval_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            session_config_path: other.session_config_path.or(self.session_config_path),
            dictionary_path: other.dictionary_path.or(self.dictionary_path),
            channel_buffer_bytes: other.channel_buffer_bytes.or(self.channel_buffer_bytes),
            stats_interval_seconds: other.stats_interval_seconds.or(self.stats_interval_seconds),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(14002),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            channel_buffer_bytes: Some(4 * 1024 * 1024),
            stats_interval_seconds: Some(30),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(14002)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    pub fn channel_buffer_bytes(&self) -> u64 {
        self.channel_buffer_bytes.unwrap_or(4 * 1024 * 1024)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds.unwrap_or(30).max(1))
    }
}

pub fn load_config() -> Config {
    // A .env file is optional; its values surface through the clap env bindings.
    dotenvy::dotenv().ok();
    resolve(Config::parse())
}

/// Layers defaults, then the config file, then CLI/env values.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    current_config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Session settings from the configured file, or the defaults. A dictionary
/// path given on the command line wins over the file's.
pub fn load_session_config(config: &Config) -> Result<SessionConfig> {
    let mut session = match &config.session_config_path {
        Some(path) => SessionConfig::from_json_file(path)
            .with_context(|| format!("loading session settings from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(path) = &config.dictionary_path {
        session.dictionary_path = Some(path.clone());
    }
    Ok(session)
}

pub fn load_dictionary(session: &SessionConfig) -> Result<DataDictionary> {
    match &session.dictionary_path {
        Some(path) => DataDictionary::from_json_file(path)
            .with_context(|| format!("loading dictionary from {}", path.display())),
        None => Ok(DataDictionary::builtin()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> Config {
        let mut argv = vec!["server_provider"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_merge_prefers_other() {
        let base = Config {
            port: Some(1),
            log_level: Some("info".into()),
            ..Default::default()
        };
        let over = Config {
            port: Some(2),
            ..Default::default()
        };
        let merged = base.merge(over);
        assert_eq!(merged.port, Some(2));
        assert_eq!(merged.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_file_then_cli_layering() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), r#"{"port": 15000, "logLevel": "debug", "statsIntervalSeconds": 5}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = resolve(cli(&["--config-path", &path, "--port", "15001"]));
        assert_eq!(config.port(), 15001);
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.stats_interval(), Duration::from_secs(5));
        assert_eq!(config.channel_buffer_bytes(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_unparseable_file_falls_back_to_defaults() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "port = 1").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = resolve(cli(&["--config-path", &path]));
        assert_eq!(config.port(), 14002);
        assert_eq!(config.log_dir(), PathBuf::from("./logs"));
    }

    #[test]
    fn test_session_config_and_dictionary_override() {
        let session_file = NamedTempFile::new().unwrap();
        fs::write(session_file.path(), r#"{"itemCapacity": 3}"#).unwrap();
        let config = Config {
            session_config_path: Some(session_file.path().to_path_buf()),
            dictionary_path: Some(PathBuf::from("/tmp/dict.json")),
            ..Default::default()
        };

        let session = load_session_config(&config).unwrap();
        assert_eq!(session.item_capacity, 3);
        assert_eq!(session.dictionary_path, Some(PathBuf::from("/tmp/dict.json")));
    }

    #[test]
    fn test_builtin_dictionary_without_path() {
        let dictionary = load_dictionary(&SessionConfig::default()).unwrap();
        assert!(!dictionary.fields.is_empty());
    }

    #[test]
    fn test_missing_session_file_is_an_error() {
        let config = Config {
            session_config_path: Some(PathBuf::from("/nonexistent/session.json")),
            ..Default::default()
        };
        assert!(load_session_config(&config).is_err());
    }
}
