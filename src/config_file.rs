//! Configuration file support
//!
//! Loads server configuration from TOML files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{
    FfmpegConfig, HealthConfig, PackagerConfig, PathsConfig, PrefetchConfig, SegmentConfig,
    ServerConfig, StoreConfig,
};

/// Configuration file format
///
/// Every section is optional; missing sections fall back to defaults so
/// a minimal file only needs to name what it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Server settings
    pub server: Option<ServerSettings>,
    /// Filesystem layout
    pub paths: Option<PathsConfig>,
    /// Encoder process settings
    pub ffmpeg: Option<FfmpegConfig>,
    /// Segmentation settings
    pub segment: Option<SegmentConfig>,
    /// Prefetcher settings
    pub prefetch: Option<PrefetchConfig>,
    /// Packager settings
    pub packager: Option<PackagerConfig>,
    /// Health monitor settings
    pub health: Option<HealthConfig>,
    /// Content store settings
    pub store: Option<StoreConfig>,
    /// Logging settings
    pub logging: Option<LoggingSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ConfigFile = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Convert to ServerConfig, filling gaps with defaults
    pub fn into_server_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        let (host, port, cors_enabled) = match self.server {
            Some(s) => (s.host, s.port, s.cors_enabled.unwrap_or(defaults.cors_enabled)),
            None => (defaults.host, defaults.port, defaults.cors_enabled),
        };

        ServerConfig {
            host,
            port,
            cors_enabled,
            log_level: self.logging.map(|l| l.level).unwrap_or(defaults.log_level),
            paths: self.paths.unwrap_or(defaults.paths),
            ffmpeg: self.ffmpeg.unwrap_or(defaults.ffmpeg),
            segment: self.segment.unwrap_or(defaults.segment),
            prefetch: self.prefetch.unwrap_or(defaults.prefetch),
            packager: self.packager.unwrap_or(defaults.packager),
            health: self.health.unwrap_or(defaults.health),
            store: self.store.unwrap_or(defaults.store),
        }
    }
}

/// Generate a fully populated configuration file at the given path,
/// useful as a starting point for deployments.
pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
    let defaults = ServerConfig::default();
    let config = ConfigFile {
        server: Some(ServerSettings {
            host: defaults.host.clone(),
            port: defaults.port,
            cors_enabled: Some(defaults.cors_enabled),
        }),
        paths: Some(defaults.paths.clone()),
        ffmpeg: Some(defaults.ffmpeg.clone()),
        segment: Some(defaults.segment.clone()),
        prefetch: Some(defaults.prefetch.clone()),
        packager: Some(defaults.packager.clone()),
        health: Some(defaults.health.clone()),
        store: Some(defaults.store.clone()),
        logging: Some(LoggingSettings {
            level: defaults.log_level,
        }),
    };
    config.to_file(path)
}

/// Load a ServerConfig from a TOML file path, falling back to defaults
/// when the file is absent or malformed.
pub fn load_or_default(path: &str) -> ServerConfig {
    if !Path::new(path).exists() {
        return ServerConfig::default();
    }
    match ConfigFile::from_file(path) {
        Ok(cf) => cf.into_server_config(),
        Err(e) => {
            tracing::warn!("Failed to load config file {}: {}. Using defaults.", path, e);
            ServerConfig::default()
        }
    }
}
