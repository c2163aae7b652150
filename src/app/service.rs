use crate::error::ServiceError;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A network listener managed by the [`Supervisor`](super::Supervisor)
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Configured listen address
    fn address(&self) -> SocketAddr;

    /// Serve until asked to stop. Returns `Ok(())` after a requested stop,
    /// an error for anything else.
    async fn start(&self) -> Result<(), ServiceError>;

    /// Resolves once the listener is bound and accepting
    async fn ready(&self);

    /// Ask the service to drain and wait for it until `deadline`.
    ///
    /// Idempotent, and safe to call whether or not `start` ever ran.
    async fn stop(&self, deadline: Instant) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Listening(SocketAddr),
    Stopped,
}

/// Start/stop bookkeeping shared by the concrete servers.
///
/// `start` goes through [`Lifecycle::run`], which hands the serving future a
/// cancellation token; `stop` cancels that token and waits for the serving
/// future to return.
pub struct Lifecycle {
    name: String,
    phase: watch::Sender<Phase>,
    stop_requested: CancellationToken,
}

impl Lifecycle {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            phase: watch::channel(Phase::Idle).0,
            stop_requested: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.phase() {
            Phase::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Drive `serve` unless a stop already happened; the phase ends `Stopped` either way
    pub async fn run<F, Fut>(&self, serve: F) -> Result<(), ServiceError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), ServiceError>>,
    {
        let began = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Idle {
                *phase = Phase::Starting;
                true
            } else {
                false
            }
        });

        if !began {
            debug!("{}: not starting, phase is {:?}", self.name, self.phase());
            return Ok(());
        }

        let result = serve(self.stop_requested.clone()).await;
        self.phase.send_replace(Phase::Stopped);
        result
    }

    /// Bind `address` and mark the service as listening
    pub async fn bind(&self, address: SocketAddr) -> Result<TcpListener, ServiceError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServiceError::Bind {
                service: self.name.clone(),
                address,
                source: e,
            })?;

        let local = listener.local_addr().unwrap_or(address);
        self.phase.send_replace(Phase::Listening(local));
        info!("{} listening at {}", self.name, local);

        Ok(listener)
    }

    pub async fn ready(&self) {
        let mut receiver = self.phase.subscribe();
        let _ = receiver
            .wait_for(|phase| matches!(phase, Phase::Listening(_)))
            .await;
    }

    pub async fn stop(&self, deadline: Instant) -> Result<(), ServiceError> {
        self.stop_requested.cancel();

        let never_started = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Idle {
                *phase = Phase::Stopped;
                true
            } else {
                false
            }
        });
        if never_started {
            debug!("{}: stopped before it started", self.name);
            return Ok(());
        }

        let mut receiver = self.phase.subscribe();
        let drained = timeout_at(deadline, receiver.wait_for(|phase| *phase == Phase::Stopped))
            .await
            .is_ok();

        if drained {
            Ok(())
        } else {
            Err(ServiceError::Stop {
                service: self.name.clone(),
                details: "still draining at the shutdown deadline".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let lifecycle = Lifecycle::new("test");

        lifecycle
            .stop(Instant::now() + Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(lifecycle.phase(), Phase::Stopped);

        // A late start must not bind anything
        let served = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&served);
        lifecycle
            .run(|_| async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(!served.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_drains_running_service() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new("test"));

        let runner = std::sync::Arc::clone(&lifecycle);
        let task = tokio::spawn(async move {
            runner
                .run(|stop| {
                    let runner = std::sync::Arc::clone(&runner);
                    async move {
                        let _listener = runner.bind(localhost()).await?;
                        stop.cancelled().await;
                        Ok(())
                    }
                })
                .await
        });

        lifecycle.ready().await;
        assert!(lifecycle.local_addr().is_some());

        let deadline = Instant::now() + Duration::from_secs(1);
        lifecycle.stop(deadline).await.unwrap();
        assert_eq!(lifecycle.phase(), Phase::Stopped);
        task.await.unwrap().unwrap();

        // Second stop is a no-op
        lifecycle.stop(deadline).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_respects_deadline() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new("stubborn"));

        let runner = std::sync::Arc::clone(&lifecycle);
        let _task = tokio::spawn(async move {
            runner
                .run(|_ignored_stop| async {
                    std::future::pending::<()>().await;
                    Ok(())
                })
                .await
        });
        while lifecycle.phase() == Phase::Idle {
            tokio::task::yield_now().await;
        }

        let started = std::time::Instant::now();
        let result = lifecycle
            .stop(Instant::now() + Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ServiceError::Stop { .. })));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap();

        let lifecycle = Lifecycle::new("test");
        let binder = &lifecycle;
        let result = lifecycle
            .run(|_| async move { binder.bind(taken).await.map(|_| ()) })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(lifecycle.phase(), Phase::Stopped);
    }
}
