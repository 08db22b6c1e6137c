use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::tunnel::ClassOfService;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings for one provider process. Every field has a default, so a config
/// file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub item_capacity: usize,
    pub tunnel_capacity: usize,
    pub login_capacity: usize,
    pub directory_capacity: usize,
    /// Buffer size for paginated field-dictionary parts.
    pub max_part_bytes: usize,
    /// Buffer size for paginated enum-dictionary parts.
    pub max_enum_part_bytes: usize,
    /// Buffer size for single-part status and refresh messages.
    pub status_msg_bytes: usize,
    pub service_name: String,
    pub service_id: u16,
    pub runtime_secs: u64,
    pub close_time_secs: u64,
    pub pacing_millis: u64,
    pub supported_class_of_service: ClassOfService,
    pub dictionary_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            item_capacity: 10,
            tunnel_capacity: 5,
            login_capacity: 1,
            directory_capacity: 1,
            max_part_bytes: 6144,
            max_enum_part_bytes: 12800,
            status_msg_bytes: 1024,
            service_name: "DIRECT_FEED".to_string(),
            service_id: 1,
            runtime_secs: 1200,
            close_time_secs: 10,
            pacing_millis: 1,
            supported_class_of_service: ClassOfService::default(),
            dictionary_path: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        #[cfg(feature = "json5")]
        let config: SessionConfig = json5::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        #[cfg(not(feature = "json5"))]
        let config: SessionConfig = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Zero capacities are allowed; sizes and the pacing interval are not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("maxPartBytes", self.max_part_bytes),
            ("maxEnumPartBytes", self.max_enum_part_bytes),
            ("statusMsgBytes", self.status_msg_bytes),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.pacing_millis == 0 {
            return Err(ConfigError::Invalid {
                field: "pacingMillis",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "serviceName",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs)
    }

    pub fn close_time(&self) -> Duration {
        Duration::from_secs(self.close_time_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_millis)
    }
}
