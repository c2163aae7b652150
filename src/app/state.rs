use super::{ServiceState, Supervisor};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

pub(super) type ServiceStates = Mutex<HashMap<String, ServiceState>>;

pub(super) async fn record_state(states: &ServiceStates, service: &str, state: ServiceState) {
    states.lock().await.insert(service.to_string(), state);
    debug!("Service '{}' state changed to: {:?}", service, state);
}

impl Supervisor {
    /// Update service state
    pub async fn set_service_state(&self, service: &str, state: ServiceState) {
        record_state(&self.service_states, service, state).await;
    }

    /// Get service state
    pub async fn get_service_state(&self, service: &str) -> Option<ServiceState> {
        let states = self.service_states.lock().await;
        states.get(service).copied()
    }

    /// Get all service states
    pub async fn get_all_service_states(&self) -> HashMap<String, ServiceState> {
        let states = self.service_states.lock().await;
        states.clone()
    }
}
