use crate::error::KvtilesError;
use std::fmt;

/// Exit status for a clean shutdown
pub const EXIT_OK: i32 = 0;
/// Exit status when a service failed while running
pub const EXIT_RUNTIME: i32 = 1;
/// Exit status for bootstrap, configuration and bind failures
pub const EXIT_FATAL: i32 = 2;

/// Service lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Why the daemon started shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(String),
    ServiceFailure(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(signal) => write!(f, "received {}", signal),
            Self::ServiceFailure(service) => write!(f, "service {} failed", service),
        }
    }
}

/// Map the daemon outcome to a process exit status
pub fn exit_code<T>(outcome: &Result<T, KvtilesError>) -> i32 {
    match outcome {
        Ok(_) => EXIT_OK,
        Err(KvtilesError::Bootstrap(_)) | Err(KvtilesError::Config(_)) => EXIT_FATAL,
        Err(KvtilesError::Service(e)) if e.is_fatal() => EXIT_FATAL,
        Err(_) => EXIT_RUNTIME,
    }
}
