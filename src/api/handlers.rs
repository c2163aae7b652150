use crate::health::ServingStatus;
use crate::storage::TileCoord;
use crate::templates::{content_type_for, TemplateVars};
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, error};

use super::server::ApiState;

const INDEX_PAGE: &str = "index.html";
const STATIC_PREFIX: &str = "/static";

/// Handler for `/tiles/{z}/{x}/{y}`
pub async fn tile_handler(
    State(state): State<ApiState>,
    Path((z, x, y)): Path<(String, String, String)>,
) -> Response {
    let Some(tile) = parse_tile(&z, &x, &y) else {
        return (StatusCode::BAD_REQUEST, "invalid tile coordinates").into_response();
    };

    match state.storage.read_tile(tile).await {
        Ok(Some(data)) => (
            [(header::CONTENT_TYPE, "application/x-protobuf")],
            data,
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Failed to read tile {:?}: {}", tile, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// `y` may carry a `.pbf` or `.mvt` suffix
pub(crate) fn parse_tile(z: &str, x: &str, y: &str) -> Option<TileCoord> {
    let y = y
        .strip_suffix(".pbf")
        .or_else(|| y.strip_suffix(".mvt"))
        .unwrap_or(y);

    let tile = TileCoord::new(z.parse().ok()?, x.parse().ok()?, y.parse().ok()?);
    tile.is_valid().then_some(tile)
}

pub async fn static_index_handler(State(state): State<ApiState>, request: Request) -> Response {
    serve_static(state, String::new(), request).await
}

pub async fn static_handler(
    State(state): State<ApiState>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    serve_static(state, path, request).await
}

async fn serve_static(state: ApiState, path: String, request: Request) -> Response {
    let path = if path.is_empty() {
        INDEX_PAGE.to_string()
    } else {
        path
    };

    if !state.templates.contains(&path) {
        return serve_file(&state, request).await;
    }

    let infos = match state.storage.load_map_infos().await {
        Ok(Some(infos)) => infos,
        Ok(None) => {
            error!("db does not contain a map");
            return (StatusCode::NOT_FOUND, "no map in DB").into_response();
        }
        Err(e) => {
            error!("error reading db: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let vars = TemplateVars {
        tiles_base_url: tiles_base_url(request.headers()),
        max_zoom: infos.max_zoom,
        center_lat: infos.center_lat,
        center_lng: infos.center_lng,
    };

    match state.templates.render(&path, &vars) {
        Ok(body) => ([(header::CONTENT_TYPE, content_type_for(&path))], body).into_response(),
        Err(e) => {
            error!("can't execute template {}: {}", path, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Scheme and host the client used to reach us, honouring `X-Forwarded-Proto`
pub(crate) fn tiles_base_url(headers: &HeaderMap) -> String {
    let forwarded_https = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        == Some("https");
    let proto = if forwarded_https { "https" } else { "http" };

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    format!("{}://{}", proto, host)
}

async fn serve_file(state: &ApiState, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();

    let relative = parts
        .uri
        .path()
        .strip_prefix(STATIC_PREFIX)
        .filter(|rest| !rest.is_empty())
        .unwrap_or("/")
        .to_string();

    parts.uri = match relative.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!("Rejecting static path {}: {}", relative, e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match ServeDir::new(&state.static_dir)
        .oneshot(Request::from_parts(parts, body))
        .await
    {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

/// Readiness endpoint: 200 only while SERVING
pub async fn healthz_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let status = match state.health.check(&state.health_service) {
        Ok(status) => status,
        Err(e) => {
            debug!("Health check failed: {}", e);
            ServingStatus::Unknown
        }
    };

    let code = if status == ServingStatus::Serving {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (code, Json(serde_json::json!({ "status": status.as_str() })))
}

pub async fn version_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": state.version,
        "infos": state.infos.as_ref(),
    }))
}
