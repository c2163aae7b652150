use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvtilesError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("System error: {message}")]
    System { message: String },
}

/// Failures of the pre-flight phase. Every variant is fatal.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("failed to open storage at {path}: {source}")]
    StorageOpen {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("failed to read map infos: {0}")]
    MapInfosUnreadable(#[source] StorageError),

    #[error("no map infos in database")]
    NoMapInfos,

    #[error("can't parse templates: {0}")]
    Template(#[from] TemplateError),
}

/// Errors reported by a service's serving loop or stop operation.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{service}: failed to listen on {address}: {source}")]
    Bind {
        service: String,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{service}: server error: {details}")]
    Serve { service: String, details: String },

    #[error("{service}: stop failed: {details}")]
    Stop { service: String, details: String },
}

impl ServiceError {
    pub fn serve<S: Into<String>, D: std::fmt::Display>(service: S, details: D) -> Self {
        Self::Serve {
            service: service.into(),
            details: details.to_string(),
        }
    }

    /// Fatal errors are configuration problems rather than runtime conditions.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database not found: {path}")]
    NotFound { path: PathBuf },

    #[error("database is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupted map infos: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template {name}: read failed: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("template {name}:{line}: {reason}")]
    Parse {
        name: String,
        line: usize,
        reason: String,
    },

    #[error("template {name} is not defined")]
    Undefined { name: String },
}

/// Health lookups fail only for names that were never set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("unknown service: {0}")]
    NotFound(String),
}

impl KvtilesError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KvtilesError>;
