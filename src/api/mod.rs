mod handlers;
mod server;

pub use server::{
    router, with_request_timeout, ApiServer, ApiState, API_SERVICE_NAME, REQUEST_TIMEOUT,
};
