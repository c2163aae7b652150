use super::GrpcHealth;
use crate::app::{Lifecycle, Service};
use crate::error::ServiceError;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_health::pb::health_server::HealthServer;

pub const HEALTH_SERVICE_NAME: &str = "grpc-health";

/// gRPC server hosting only the health service.
///
/// Stopped last so polling clients can still read the final NOT_SERVING;
/// its stop waits for in-flight RPCs rather than cutting them.
pub struct GrpcHealthServer {
    address: SocketAddr,
    health: GrpcHealth,
    lifecycle: Lifecycle,
}

impl GrpcHealthServer {
    pub fn new(address: SocketAddr, health: GrpcHealth) -> Self {
        Self {
            address,
            health,
            lifecycle: Lifecycle::new(HEALTH_SERVICE_NAME),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }
}

#[async_trait]
impl Service for GrpcHealthServer {
    fn name(&self) -> &str {
        HEALTH_SERVICE_NAME
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.lifecycle
            .run(|stop| async move {
                let listener = self.lifecycle.bind(self.address).await?;

                Server::builder()
                    .add_service(HealthServer::new(self.health.clone()))
                    .serve_with_incoming_shutdown(
                        TcpListenerStream::new(listener),
                        stop.cancelled_owned(),
                    )
                    .await
                    .map_err(|e| ServiceError::serve(HEALTH_SERVICE_NAME, e))
            })
            .await
    }

    async fn ready(&self) {
        self.lifecycle.ready().await
    }

    async fn stop(&self, deadline: tokio::time::Instant) -> Result<(), ServiceError> {
        self.lifecycle.stop(deadline).await
    }
}
