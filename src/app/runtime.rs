use super::bootstrap::bootstrap;
use super::state::record_state;
use super::{ServiceState, ShutdownReason, Supervisor};
use crate::config::KvtilesConfig;
use crate::error::{KvtilesError, ServiceError};
use crate::health::{HealthRegistry, ServingStatus};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Extra time service tasks get to return after the shutdown deadline
const JOIN_GRACE: Duration = Duration::from_millis(500);

impl Supervisor {
    /// Start every service and block until `interrupt` resolves or a service
    /// fails, then shut down.
    ///
    /// Returns why shutdown began, or the error that should decide the exit
    /// status: fatal errors win over runtime ones.
    pub async fn run<F>(&self, interrupt: F) -> Result<ShutdownReason, ServiceError>
    where
        F: Future<Output = ShutdownReason>,
    {
        info!("Starting {} services", self.services.len());

        let mut tasks = JoinSet::new();
        for service in &self.services {
            let service = Arc::clone(service);
            let states = Arc::clone(&self.service_states);
            let failure = self.failure.clone();
            let first_failure = Arc::clone(&self.first_failure);
            let shutting_down = Arc::clone(&self.shutdown_started);

            record_state(&states, service.name(), ServiceState::Starting).await;

            tasks.spawn(async move {
                let name = service.name().to_string();

                // Any exit that shutdown did not ask for is a failure
                let result = match AssertUnwindSafe(service.start()).catch_unwind().await {
                    Ok(Ok(())) if !shutting_down.load(Ordering::SeqCst) => Err(
                        ServiceError::serve(&name, "exited before shutdown was requested"),
                    ),
                    Ok(result) => result,
                    Err(panic) => Err(ServiceError::serve(
                        &name,
                        format!("panicked: {}", panic_message(panic.as_ref())),
                    )),
                };

                match &result {
                    Ok(()) => debug!("{} service returned", name),
                    Err(e) => {
                        error!("{} service failed: {}", name, e);
                        record_state(&states, &name, ServiceState::Failed).await;
                        let _ = first_failure.set(name.clone());
                        failure.cancel();
                    }
                }

                (name, result)
            });
        }

        let all_ready = join_all(self.services.iter().map(|service| service.ready()));
        tokio::pin!(interrupt);

        let reason = tokio::select! {
            biased;
            reason = &mut interrupt => reason,
            _ = self.failure.cancelled() => self.failure_reason(),
            _ = all_ready => {
                for service in &self.services {
                    self.set_service_state(service.name(), ServiceState::Running).await;
                }
                self.health.set_status(&self.health_name, ServingStatus::Serving);
                info!("All services listening, {} is {}", self.health_name, ServingStatus::Serving);

                tokio::select! {
                    biased;
                    reason = &mut interrupt => reason,
                    _ = self.failure.cancelled() => self.failure_reason(),
                }
            }
        };

        info!("Shutdown initiated: {}", reason);

        let deadline = Instant::now() + self.shutdown_timeout;
        self.shutdown_until(deadline).await;

        let mut errors = Vec::new();
        let join_deadline = deadline + JOIN_GRACE;
        loop {
            match timeout_at(join_deadline, tasks.join_next()).await {
                Ok(Some(Ok((_, Ok(()))))) => {}
                Ok(Some(Ok((_, Err(e))))) => errors.push(e),
                Ok(Some(Err(e))) => {
                    error!("Service task panicked: {}", e);
                    errors.push(ServiceError::serve("service task", e));
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "{} service tasks still running after the shutdown deadline, aborting",
                        tasks.len()
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        match errors.iter().position(ServiceError::is_fatal) {
            Some(index) => Err(errors.swap_remove(index)),
            None if !errors.is_empty() => Err(errors.swap_remove(0)),
            None => Ok(reason),
        }
    }

    fn failure_reason(&self) -> ShutdownReason {
        let service = self
            .first_failure
            .get()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        ShutdownReason::ServiceFailure(service)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Resolves on the first SIGINT or SIGTERM
pub async fn wait_for_signal() -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let signal = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                };
                info!("Received {} signal", signal);
                return ShutdownReason::Signal(signal.to_string());
            }
            Err(e) => error!("Failed to register SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT signal (Ctrl+C)");
    ShutdownReason::Signal("SIGINT".to_string())
}

/// Bootstrap, wire the services and supervise them until `interrupt` fires
pub async fn run_daemon<F>(
    config: &KvtilesConfig,
    interrupt: F,
) -> Result<ShutdownReason, KvtilesError>
where
    F: Future<Output = ShutdownReason>,
{
    let bootstrapped = bootstrap(config).await.map_err(|e| {
        error!("Bootstrap failed: {}", e);
        e
    })?;

    let health = Arc::new(HealthRegistry::new());
    let supervisor = Supervisor::for_daemon(config, bootstrapped, health)?;

    let reason = supervisor.run(interrupt).await?;
    info!("kvtilesd stopped: {}", reason);
    Ok(reason)
}
