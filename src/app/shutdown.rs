use super::{ServiceState, Supervisor};
use crate::api::API_SERVICE_NAME;
use crate::error::{KvtilesError, Result};
use crate::health::{ServingStatus, HEALTH_SERVICE_NAME};
use crate::metrics::METRICS_SERVICE_NAME;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Flip the daemon's health name to NOT_SERVING
    MarkNotServing,
    /// Stop the named service
    Stop(String),
}

/// Order in which the daemon is taken down.
///
/// Health goes NOT_SERVING before any listener closes, and the gRPC health
/// server is stopped last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPlan {
    steps: Vec<ShutdownStep>,
}

impl ShutdownPlan {
    pub fn new(steps: Vec<ShutdownStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[ShutdownStep] {
        &self.steps
    }

    /// The plan must open with `MarkNotServing` and stop every service exactly once
    pub fn validate<'a, I>(&self, services: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.steps.first() != Some(&ShutdownStep::MarkNotServing) {
            return Err(KvtilesError::system(
                "Shutdown plan must mark the daemon NOT_SERVING first",
            ));
        }

        let mut stopped = HashSet::new();
        for step in &self.steps[1..] {
            match step {
                ShutdownStep::MarkNotServing => {
                    return Err(KvtilesError::system(
                        "Shutdown plan marks NOT_SERVING more than once",
                    ));
                }
                ShutdownStep::Stop(name) => {
                    if !stopped.insert(name.as_str()) {
                        return Err(KvtilesError::system(format!(
                            "Shutdown plan stops {} twice",
                            name
                        )));
                    }
                }
            }
        }

        let expected: HashSet<&str> = services.into_iter().collect();
        if let Some(missing) = expected.difference(&stopped).next() {
            return Err(KvtilesError::system(format!(
                "Shutdown plan never stops {}",
                missing
            )));
        }
        if let Some(unknown) = stopped.difference(&expected).next() {
            return Err(KvtilesError::system(format!(
                "Shutdown plan stops unknown service {}",
                unknown
            )));
        }

        Ok(())
    }
}

impl Default for ShutdownPlan {
    fn default() -> Self {
        Self::new(vec![
            ShutdownStep::MarkNotServing,
            ShutdownStep::Stop(METRICS_SERVICE_NAME.to_string()),
            ShutdownStep::Stop(API_SERVICE_NAME.to_string()),
            ShutdownStep::Stop(HEALTH_SERVICE_NAME.to_string()),
        ])
    }
}

impl Supervisor {
    /// Run the shutdown plan with a fresh deadline.
    ///
    /// Only the first call does anything; later calls return at once.
    pub async fn shutdown(&self) {
        self.shutdown_until(Instant::now() + self.shutdown_timeout)
            .await;
    }

    pub(super) async fn shutdown_until(&self, deadline: Instant) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Beginning graceful shutdown");

        for step in self.plan.steps() {
            match step {
                ShutdownStep::MarkNotServing => {
                    self.health
                        .set_status(&self.health_name, ServingStatus::NotServing);
                    info!("{} marked {}", self.health_name, ServingStatus::NotServing);
                }
                ShutdownStep::Stop(name) => self.stop_service(name, deadline).await,
            }
        }

        info!("Graceful shutdown completed");
    }

    /// Stop errors and timeouts are logged, never propagated
    async fn stop_service(&self, name: &str, deadline: Instant) {
        let Some(service) = self.service(name) else {
            warn!("No service named {} to stop", name);
            return;
        };

        // A failed service keeps its state for diagnostics
        let failed = self.get_service_state(name).await == Some(ServiceState::Failed);
        if !failed {
            self.set_service_state(name, ServiceState::Stopping).await;
        }

        info!("Stopping {} service", name);
        let state = match timeout_at(deadline, service.stop(deadline)).await {
            Ok(Ok(())) => {
                info!("{} service stopped", name);
                ServiceState::Stopped
            }
            Ok(Err(e)) => {
                error!("Error stopping {} service: {}", name, e);
                ServiceState::Failed
            }
            Err(_) => {
                error!("{} service stop timeout", name);
                ServiceState::Failed
            }
        };

        if !failed {
            self.set_service_state(name, state).await;
        }
    }
}
