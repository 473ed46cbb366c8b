//! Configuration for the memkv coordinator

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the membership gRPC API
    pub bind_addr: SocketAddr,

    /// Bind address for the admin HTTP API
    pub admin_addr: SocketAddr,

    /// Durable-log directory
    pub log_path: PathBuf,

    /// Replication group size
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_replication_factor() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5100".parse().unwrap(),
            admin_addr: "0.0.0.0:5180".parse().unwrap(),
            log_path: PathBuf::from("./coord-log"),
            replication_factor: default_replication_factor(),
            log_level: default_log_level(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoordinatorConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.replication_factor == 0 {
            return Err(crate::Error::InvalidConfig(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.log_path.as_os_str().is_empty() {
            return Err(crate::Error::InvalidConfig("log_path is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.replication_factor, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_replication() {
        let config = CoordinatorConfig {
            replication_factor: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.json");

        let config = CoordinatorConfig::default();
        config.to_file(&path).unwrap();

        let loaded = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(loaded.bind_addr, config.bind_addr);
        assert_eq!(loaded.replication_factor, config.replication_factor);
    }
}
