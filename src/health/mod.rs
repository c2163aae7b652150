mod grpc;
mod registry;
mod server;

pub use grpc::GrpcHealth;
pub use registry::{HealthRegistry, ServingStatus};
pub use server::{GrpcHealthServer, HEALTH_SERVICE_NAME};
