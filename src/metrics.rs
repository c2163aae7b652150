use crate::api::{with_request_timeout, REQUEST_TIMEOUT};
use crate::app::{Lifecycle, Service};
use crate::error::ServiceError;
use crate::storage::MapInfos;
use async_trait::async_trait;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

pub const METRICS_SERVICE_NAME: &str = "http-metrics";

const NAMESPACE: &str = "kvtilesd";

/// Prometheus collectors exposed on the metrics port
pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_request_duration: HistogramVec,
}

impl Metrics {
    /// Register every collector and record the build and data versions
    pub fn new(version: &str, infos: &MapInfos) -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let version_gauge = IntGaugeVec::new(
            Opts::new("version", "Build version of the running daemon"),
            &["version"],
        )?;
        let data_version_gauge = IntGaugeVec::new(
            Opts::new("data_version", "Region and index time of the served map"),
            &["version"],
        )?;
        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests by handler and status code"),
            &["handler", "code"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency by handler",
            ),
            &["handler"],
        )?;

        registry.register(Box::new(version_gauge.clone()))?;
        registry.register(Box::new(data_version_gauge.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        version_gauge.with_label_values(&[version]).set(1);
        data_version_gauge
            .with_label_values(&[infos.data_version().as_str()])
            .set(1);

        Ok(Self {
            registry,
            http_requests,
            http_request_duration,
        })
    }

    pub fn observe_request(&self, handler: &str, status: StatusCode, elapsed_secs: f64) {
        self.http_requests
            .with_label_values(&[handler, status.as_str()])
            .inc();
        self.http_request_duration
            .with_label_values(&[handler])
            .observe(elapsed_secs);
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Records count and latency of every request routed through it
pub async fn track_requests(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let handler = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let started = Instant::now();
    let response = next.run(request).await;
    metrics.observe_request(&handler, response.status(), started.elapsed().as_secs_f64());

    response
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    with_request_timeout(router, REQUEST_TIMEOUT)
}

/// HTTP server exposing `/metrics`, dropped first on shutdown
pub struct MetricsServer {
    address: SocketAddr,
    metrics: Arc<Metrics>,
    lifecycle: Lifecycle,
}

impl MetricsServer {
    pub fn new(address: SocketAddr, metrics: Arc<Metrics>) -> Self {
        Self {
            address,
            metrics,
            lifecycle: Lifecycle::new(METRICS_SERVICE_NAME),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }
}

#[async_trait]
impl Service for MetricsServer {
    fn name(&self) -> &str {
        METRICS_SERVICE_NAME
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.lifecycle
            .run(|stop| async move {
                let listener = self.lifecycle.bind(self.address).await?;

                axum::serve(listener, router(Arc::clone(&self.metrics)))
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
                    .map_err(|e| ServiceError::serve(METRICS_SERVICE_NAME, e))
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    fn infos() -> MapInfos {
        MapInfos {
            region: "france".to_string(),
            index_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            min_zoom: 0,
            max_zoom: 14,
            center_lat: 48.85,
            center_lng: 2.35,
        }
    }

    #[test]
    fn test_render_contains_versions() {
        let metrics = Metrics::new("1.2.3", &infos()).unwrap();
        let text = metrics.render().unwrap();

        assert!(text.contains("kvtilesd_version{version=\"1.2.3\"} 1"));
        assert!(text.contains("kvtilesd_data_version{version=\"france 2024-03-01T12:00:00Z\"} 1"));
    }

    #[test]
    fn test_observe_request() {
        let metrics = Metrics::new("dev", &infos()).unwrap();
        metrics.observe_request("/tiles/:z/:x/:y", StatusCode::OK, 0.01);
        metrics.observe_request("/tiles/:z/:x/:y", StatusCode::NOT_FOUND, 0.02);

        let text = metrics.render().unwrap();
        assert!(text.contains(
            "kvtilesd_http_requests_total{code=\"200\",handler=\"/tiles/:z/:x/:y\"} 1"
        ));
        assert!(text.contains(
            "kvtilesd_http_requests_total{code=\"404\",handler=\"/tiles/:z/:x/:y\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(Metrics::new("dev", &infos()).unwrap());
        let response = router(metrics)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("kvtilesd_version"));
    }
}
