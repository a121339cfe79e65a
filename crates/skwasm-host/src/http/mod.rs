//! HTTP endpoint bridge (§4.F), hybrid interceptors (§4.G), and the binary
//! WebSocket upgrade surface (§4.E) the host owns.
//!
//! A single `axum::Router` is built once, at `Host` construction, and
//! never rebuilt as plugins start/stop/reload: every plugin-specific path
//! under `/plugins/<id>/...` is dispatched through one catch-all route
//! that consults the lifecycle manager's live state at request time,
//! mirroring the way the rest of the pack's HTTP-facing hosts (see
//! `ultrafast-gateway`'s `server.rs`) keep routing static and push
//! per-tenant variability into `AppState`.

pub mod bridge;
pub mod interceptors;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::Path as AxumPath;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use axum::routing::get;
use axum::Router;

use crate::Host;

/// Shared state every HTTP handler closes over. Cloning is cheap — every
/// field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<Host>,
}

/// Build the host's HTTP router (§6 "Host HTTP surface"). The embedding
/// server mounts this under whatever prefix it likes; paths here are
/// exactly as named in the spec, rooted at `/`.
pub fn router(host: Arc<Host>) -> Router {
    let state = AppState { host };

    Router::new()
        .route("/plugins/:id", get(bridge::plugin_metadata))
        .route("/plugins/:id/config", get(bridge::get_config).post(bridge::post_config))
        .route("/plugins/:id/api/logs", get(interceptors::log_viewer))
        .route("/plugins/:id/tiles/:chart_id/:z/:x/:y", get(interceptors::tile))
        .route("/plugins/:id/api/charts/upload", axum::routing::post(interceptors::chart_upload))
        .route("/plugins/:id/api/charts/file/:chart_id", axum::routing::delete(interceptors::chart_delete))
        .route("/plugins/:id/*rest", any(bridge::dispatch))
        .route(
            "/signalk/v2/api/resources/:resource_type",
            get(bridge::resource_list).post(bridge::resource_set_new),
        )
        .route(
            "/signalk/v2/api/resources/:resource_type/:resource_id",
            get(bridge::resource_get).put(bridge::resource_set).delete(bridge::resource_delete),
        )
        .route("/signalk/v2/api/weather/_providers", get(bridge::weather_providers))
        .route("/signalk/v2/api/weather/observations", get(bridge::weather_observations))
        .route("/signalk/v2/api/weather/forecasts/daily", get(bridge::weather_forecasts_daily))
        .route("/signalk/v2/api/weather/forecasts/point", get(bridge::weather_forecasts_point))
        .route("/signalk/v2/api/weather/warnings", get(bridge::weather_warnings))
        .route("/signalk/v2/api/vessels/self/radars", get(bridge::radar_list))
        .route("/signalk/v2/api/vessels/self/radars/:radar_id", get(bridge::radar_info))
        .route(
            "/signalk/v2/api/vessels/self/radars/:radar_id/:control",
            any(bridge::radar_control),
        )
        .route("/signalk/v2/api/vessels/self/radars/:radar_id/stream", get(radar_stream_upgrade))
        .route("/signalk/v2/api/streams/*stream_id", get(stream_upgrade))
        .with_state(state)
}

/// `GET /signalk/v2/api/streams/<stream-id>` — generic binary stream
/// upgrade, the stream id taken verbatim from the path (it may itself
/// contain `/`, e.g. `radars/radar-0`).
async fn stream_upgrade(
    State(state): State<AppState>,
    AxumPath(stream_id): AxumPath<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.host.lifecycle().stream_manager_for(&stream_id).await {
        Some(streams) => streams.upgrade(stream_id, ws),
        None => (StatusCode::NOT_FOUND, "no plugin owns that stream").into_response(),
    }
}

/// `GET /signalk/v2/api/vessels/self/radars/<id>/stream` — convenience
/// alias onto stream id `radars/<id>` (§4.E).
async fn radar_stream_upgrade(
    State(state): State<AppState>,
    AxumPath(radar_id): AxumPath<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let stream_id = format!("radars/{radar_id}");
    match state.host.lifecycle().stream_manager_for(&stream_id).await {
        Some(streams) => streams.upgrade(stream_id, ws),
        None => (StatusCode::NOT_FOUND, "no plugin owns that radar stream").into_response(),
    }
}
