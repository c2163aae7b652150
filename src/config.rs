use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KvtilesConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    /// DEBUG|INFO|WARN|ERROR
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json, pretty or compact
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Map database path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory holding static files and page templates
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address every listener binds to
    #[serde(default = "default_bind_ip")]
    pub ip: String,

    /// Prometheus metrics HTTP port
    #[serde(default = "default_http_metrics_port")]
    pub http_metrics_port: u16,

    /// Tiles and static pages HTTP port
    #[serde(default = "default_http_api_port")]
    pub http_api_port: u16,

    /// gRPC health port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Budget for the whole stop phase, all services combined
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub db_path: Option<String>,
    pub static_dir: Option<String>,
    pub http_metrics_port: Option<u16>,
    pub http_api_port: Option<u16>,
    pub health_port: Option<u16>,
    pub shutdown_timeout_secs: Option<u64>,
}

impl KvtilesConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load(path, &ConfigOverrides::default())
    }

    /// Layer defaults, the optional TOML file, `KVTILES__*` variables and CLI overrides
    pub fn load<P: AsRef<Path>>(path: P, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("log.level", default_log_level())?
            .set_default("log.format", default_log_format())?
            .set_default("storage.db_path", path_to_string(default_db_path()))?
            .set_default("storage.static_dir", path_to_string(default_static_dir()))?
            .set_default("server.ip", default_bind_ip())?
            .set_default("server.http_metrics_port", default_http_metrics_port())?
            .set_default("server.http_api_port", default_http_api_port())?
            .set_default("server.health_port", default_health_port())?
            .set_default(
                "server.shutdown_timeout_secs",
                default_shutdown_timeout_secs(),
            )?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("KVTILES").separator("__"))
            .set_override_option("log.level", overrides.log_level.clone())?
            .set_override_option("log.format", overrides.log_format.clone())?
            .set_override_option("storage.db_path", overrides.db_path.clone())?
            .set_override_option("storage.static_dir", overrides.static_dir.clone())?
            .set_override_option("server.http_metrics_port", overrides.http_metrics_port)?
            .set_override_option("server.http_api_port", overrides.http_api_port)?
            .set_override_option("server.health_port", overrides.health_port)?
            .set_override_option(
                "server.shutdown_timeout_secs",
                overrides.shutdown_timeout_secs,
            )?
            .build()?;

        let config: KvtilesConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.log.level.to_ascii_uppercase().as_str(),
            "DEBUG" | "INFO" | "WARN" | "ERROR"
        ) {
            return Err(ConfigError::Message(format!(
                "Unknown log level '{}', expected DEBUG|INFO|WARN|ERROR",
                self.log.level
            )));
        }

        self.bind_ip()?;

        let ports = [
            ("http_metrics_port", self.server.http_metrics_port),
            ("http_api_port", self.server.http_api_port),
            ("health_port", self.server.health_port),
        ];
        let mut seen = HashSet::new();
        for (name, port) in ports {
            if port == 0 {
                return Err(ConfigError::Message(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
            if !seen.insert(port) {
                return Err(ConfigError::Message(format!(
                    "{} {} is already used by another listener",
                    name, port
                )));
            }
        }

        if self.server.shutdown_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "shutdown_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.server
            .ip
            .parse()
            .map_err(|e| ConfigError::Message(format!("Invalid bind ip '{}': {}", self.server.ip, e)))
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.server.http_metrics_port))
    }

    pub fn api_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.server.http_api_port))
    }

    pub fn health_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.server.health_port))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl Default for KvtilesConfig {
    fn default() -> Self {
        Self {
            log: LogConfig {
                level: default_log_level(),
                format: default_log_format(),
            },
            storage: StorageConfig {
                db_path: default_db_path(),
                static_dir: default_static_dir(),
            },
            server: ServerConfig {
                ip: default_bind_ip(),
                http_metrics_port: default_http_metrics_port(),
                http_api_port: default_http_api_port(),
                health_port: default_health_port(),
                shutdown_timeout_secs: default_shutdown_timeout_secs(),
            },
        }
    }
}

fn path_to_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

// Default value functions
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("map.db")
}
fn default_static_dir() -> PathBuf {
    PathBuf::from("./static")
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_http_metrics_port() -> u16 {
    8088
}
fn default_http_api_port() -> u16 {
    9201
}
fn default_health_port() -> u16 {
    6666
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}
