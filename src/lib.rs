pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod storage;
pub mod templates;

pub use app::{run_daemon, ServiceState, ShutdownPlan, ShutdownReason, ShutdownStep, Supervisor};
pub use config::KvtilesConfig;
pub use error::{KvtilesError, Result};
pub use health::{HealthRegistry, ServingStatus};
pub use storage::{DirectoryStorage, MapInfos, MapStorage, TileCoord};
