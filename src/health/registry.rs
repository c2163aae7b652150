use crate::error::HealthError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Serving status of a named service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
}

impl ServingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingStatus::Unknown => "UNKNOWN",
            ServingStatus::Serving => "SERVING",
            ServingStatus::NotServing => "NOT_SERVING",
        }
    }
}

impl fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type StatusSender = watch::Sender<Option<ServingStatus>>;

/// Process-wide health register keyed by service name.
///
/// The single source of truth read by both the gRPC health service and the
/// HTTP `/healthz` endpoint. Each name is backed by a watch channel so that
/// `Watch` RPCs observe every write; `None` means the name was never set.
///
/// `NotServing` is terminal: once a name has been marked not serving, later
/// writes that would move it anywhere else are dropped.
pub struct HealthRegistry {
    services: RwLock<HashMap<String, StatusSender>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Overwrite the status of `service`
    pub fn set_status(&self, service: &str, status: ServingStatus) {
        let mut services = self.services.write();
        let sender = services
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(None).0);

        let current = *sender.borrow();
        if current == Some(ServingStatus::NotServing) && status != ServingStatus::NotServing {
            warn!(
                "Ignoring {} for '{}': status is already NOT_SERVING",
                status, service
            );
            return;
        }

        sender.send_replace(Some(status));
        if current != Some(status) {
            info!("Health status of '{}' set to {}", service, status);
        } else {
            debug!("Health status of '{}' unchanged ({})", service, status);
        }
    }

    /// Latest status of `service`, or `NotFound` if it was never set
    pub fn check(&self, service: &str) -> Result<ServingStatus, HealthError> {
        self.services
            .read()
            .get(service)
            .and_then(|sender| *sender.borrow())
            .ok_or_else(|| HealthError::NotFound(service.to_string()))
    }

    /// Subscribe to every future write for `service`.
    ///
    /// Subscribing to a name that was never set registers it without a
    /// status, so `check` keeps reporting `NotFound` for it. Such entries
    /// are dropped again once their last watcher is gone.
    pub fn watch(&self, service: &str) -> watch::Receiver<Option<ServingStatus>> {
        if let Some(sender) = self.services.read().get(service) {
            return sender.subscribe();
        }

        let mut services = self.services.write();
        services.retain(|_, sender| sender.borrow().is_some() || sender.receiver_count() > 0);
        services
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Number of names currently held, set or watched
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
