use super::bootstrap::Bootstrapped;
use super::shutdown::ShutdownPlan;
use super::state::ServiceStates;
use super::Service;
use crate::api::{ApiServer, ApiState};
use crate::config::KvtilesConfig;
use crate::error::{KvtilesError, Result};
use crate::health::{GrpcHealth, GrpcHealthServer, HealthRegistry};
use crate::metrics::{Metrics, MetricsServer};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Health name flipped to SERVING once every listener is up
pub const APP_HEALTH_NAME: &str = "grpc.health.v1.kvtilesd";

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the services and drives them from start to a bounded shutdown
pub struct Supervisor {
    pub(super) services: Vec<Arc<dyn Service>>,
    pub(super) health: Arc<HealthRegistry>,
    pub(super) health_name: String,
    pub(super) plan: ShutdownPlan,
    pub(super) shutdown_timeout: Duration,

    // Lifecycle management
    pub(super) service_states: Arc<ServiceStates>,
    pub(super) failure: CancellationToken,
    pub(super) first_failure: Arc<OnceLock<String>>,
    pub(super) shutdown_started: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    /// Wire the three daemon services around the bootstrapped data
    pub fn for_daemon(
        config: &KvtilesConfig,
        bootstrapped: Bootstrapped,
        health: Arc<HealthRegistry>,
    ) -> Result<Self> {
        let version = env!("CARGO_PKG_VERSION");
        let metrics = Arc::new(Metrics::new(version, &bootstrapped.infos)?);

        let metrics_server = MetricsServer::new(config.metrics_addr()?, Arc::clone(&metrics));

        let api_state = ApiState::new(
            bootstrapped.storage,
            bootstrapped.infos,
            bootstrapped.templates,
            config.storage.static_dir.clone(),
            Arc::clone(&health),
            APP_HEALTH_NAME.to_string(),
            metrics,
            version.to_string(),
        );
        let api_server = ApiServer::new(config.api_addr()?, api_state);

        let health_server =
            GrpcHealthServer::new(config.health_addr()?, GrpcHealth::new(Arc::clone(&health)));

        Self::builder()
            .service(Arc::new(metrics_server))
            .service(Arc::new(api_server))
            .service(Arc::new(health_server))
            .health(health, APP_HEALTH_NAME)
            .shutdown_timeout(config.shutdown_timeout())
            .build()
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        Arc::clone(&self.health)
    }

    pub fn plan(&self) -> &ShutdownPlan {
        &self.plan
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .iter()
            .find(|service| service.name() == name)
            .cloned()
    }
}

pub struct SupervisorBuilder {
    services: Vec<Arc<dyn Service>>,
    health: Option<(Arc<HealthRegistry>, String)>,
    plan: Option<ShutdownPlan>,
    shutdown_timeout: Duration,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            health: None,
            plan: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Add a service; names must be unique
    pub fn service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Set the registry and the name whose status reflects the whole daemon
    pub fn health<S: Into<String>>(mut self, registry: Arc<HealthRegistry>, name: S) -> Self {
        self.health = Some((registry, name.into()));
        self
    }

    pub fn plan(mut self, plan: ShutdownPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Budget shared by every stop in the plan
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        let (health, health_name) = self
            .health
            .ok_or_else(|| KvtilesError::system("Health registry is required"))?;

        if self.shutdown_timeout.is_zero() {
            return Err(KvtilesError::system("Shutdown timeout must be positive"));
        }

        let mut states = HashMap::new();
        for service in &self.services {
            if states
                .insert(service.name().to_string(), super::ServiceState::Stopped)
                .is_some()
            {
                return Err(KvtilesError::system(format!(
                    "Duplicate service name: {}",
                    service.name()
                )));
            }
        }

        let plan = self.plan.unwrap_or_default();
        plan.validate(self.services.iter().map(|service| service.name()))?;

        Ok(Supervisor {
            services: self.services,
            health,
            health_name,
            plan,
            shutdown_timeout: self.shutdown_timeout,
            service_states: Arc::new(Mutex::new(states)),
            failure: CancellationToken::new(),
            first_failure: Arc::new(OnceLock::new()),
            shutdown_started: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
