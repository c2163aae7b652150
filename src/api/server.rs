use crate::app::{Lifecycle, Service};
use crate::error::ServiceError;
use crate::health::HealthRegistry;
use crate::metrics::{track_requests, Metrics};
use crate::storage::{MapInfos, MapStorage};
use crate::templates::TemplateSet;
use async_trait::async_trait;
use axum::{middleware, routing::get, Router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use super::handlers::{
    healthz_handler, static_handler, static_index_handler, tile_handler, version_handler,
};

pub const API_SERVICE_NAME: &str = "http-api";

/// Read and write budget for a single HTTP request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Answer 408 for any request still running after `timeout`
pub fn with_request_timeout(router: Router, timeout: Duration) -> Router {
    router.layer(TimeoutLayer::new(timeout))
}

/// Shared state for the API router
#[derive(Clone)]
pub struct ApiState {
    pub(crate) storage: Arc<dyn MapStorage>,
    pub(crate) infos: Arc<MapInfos>,
    pub(crate) templates: Arc<TemplateSet>,
    pub(crate) static_dir: PathBuf,
    pub(crate) health: Arc<HealthRegistry>,
    pub(crate) health_service: String,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) version: String,
}

impl ApiState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn MapStorage>,
        infos: MapInfos,
        templates: TemplateSet,
        static_dir: PathBuf,
        health: Arc<HealthRegistry>,
        health_service: String,
        metrics: Arc<Metrics>,
        version: String,
    ) -> Self {
        Self {
            storage,
            infos: Arc::new(infos),
            templates: Arc::new(templates),
            static_dir,
            health,
            health_service,
            metrics,
            version,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let tiles = Router::new()
        .route("/tiles/:z/:x/:y", get(tile_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.metrics),
            track_requests,
        ));

    let api = Router::new()
        .merge(tiles)
        .route("/static/", get(static_index_handler))
        .route("/static/*path", get(static_handler))
        .route("/healthz", get(healthz_handler))
        .route("/version", get(version_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    with_request_timeout(api, REQUEST_TIMEOUT)
}

/// HTTP server for tiles, static pages and readiness
pub struct ApiServer {
    address: SocketAddr,
    state: ApiState,
    lifecycle: Lifecycle,
}

impl ApiServer {
    pub fn new(address: SocketAddr, state: ApiState) -> Self {
        Self {
            address,
            state,
            lifecycle: Lifecycle::new(API_SERVICE_NAME),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }
}

#[async_trait]
impl Service for ApiServer {
    fn name(&self) -> &str {
        API_SERVICE_NAME
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.lifecycle
            .run(|stop| async move {
                let listener = self.lifecycle.bind(self.address).await?;

                axum::serve(listener, router(self.state.clone()))
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
                    .map_err(|e| ServiceError::serve(API_SERVICE_NAME, e))
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
