//! Standard gRPC health checking protocol over the health registry.
//! See: https://github.com/grpc/grpc/blob/master/doc/health-checking.md

use super::registry::{HealthRegistry, ServingStatus};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus as PbServingStatus;
use tonic_health::pb::health_server::Health;
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};
use tracing::debug;

impl From<ServingStatus> for PbServingStatus {
    fn from(status: ServingStatus) -> Self {
        match status {
            ServingStatus::Unknown => PbServingStatus::Unknown,
            ServingStatus::Serving => PbServingStatus::Serving,
            ServingStatus::NotServing => PbServingStatus::NotServing,
        }
    }
}

fn response(status: Option<ServingStatus>) -> HealthCheckResponse {
    let status = status
        .map(PbServingStatus::from)
        .unwrap_or(PbServingStatus::ServiceUnknown);

    HealthCheckResponse {
        status: status as i32,
    }
}

/// `grpc.health.v1.Health` implementation backed by [`HealthRegistry`]
#[derive(Clone)]
pub struct GrpcHealth {
    registry: Arc<HealthRegistry>,
}

impl GrpcHealth {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl Health for GrpcHealth {
    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        debug!("gRPC health check for service: {:?}", service);

        match self.registry.check(&service) {
            Ok(status) => Ok(Response::new(response(Some(status)))),
            Err(e) => Err(Status::not_found(e.to_string())),
        }
    }

    /// Sends the current status, then one message per write until the client goes away
    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let service = request.into_inner().service;
        debug!("gRPC health watch for service: {:?}", service);

        let mut receiver = self.registry.watch(&service);

        let stream = async_stream::stream! {
            loop {
                let status = *receiver.borrow_and_update();
                yield Ok::<_, Status>(response(status));

                // NOT_SERVING is terminal; end the stream
                if status == Some(ServingStatus::NotServing) || receiver.changed().await.is_err() {
                    break;
                }
            }
        };

        Ok(Response::new(Box::pin(stream) as Self::WatchStream))
    }
}
