mod bootstrap;
mod orchestrator;
mod runtime;
mod service;
mod shutdown;
mod state;
mod types;


pub use bootstrap::{bootstrap, prepare, Bootstrapped};
pub use orchestrator::{Supervisor, SupervisorBuilder, APP_HEALTH_NAME, DEFAULT_SHUTDOWN_TIMEOUT};
pub use runtime::{run_daemon, wait_for_signal};
pub use service::{Lifecycle, Phase, Service};
pub use shutdown::{ShutdownPlan, ShutdownStep};
pub use types::{exit_code, ServiceState, ShutdownReason, EXIT_FATAL, EXIT_OK, EXIT_RUNTIME};
