//! HTTP endpoint bridge and provider/PUT HTTP dispatch (§4.F, §4.J).
//!
//! Every handler here turns an inbound request into a JSON envelope, hands
//! it to a guest export through `LifecycleManager::call_named_export` (or
//! one of its aliases), and marshals the guest's JSON reply back into an
//! `axum::Response`. None of these handlers touch guest memory directly —
//! that crosses the ABI boundary inside `runtime::dialect_{a,b,c}`, behind
//! `PluginInstance::call_json_export` / `call_http_handler`.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::Path as AxumPath;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::HeaderName;
use axum::http::HeaderValue;
use axum::http::Method;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;
use tracing::warn;

use crate::error::HostError;
use crate::http::AppState;

/// Map a `HostError` surfacing out of a guest call to the HTTP status the
/// bridge reports, per the propagation rules in §7: capability denial and
/// missing-export conditions are request-scoped, never plugin-state
/// changes; a `RuntimeFault` has already driven the crash pathway by the
/// time it reaches here.
fn error_response(error: HostError) -> Response {
    let status = match &error {
        HostError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        HostError::CapabilityDenied { .. } => StatusCode::FORBIDDEN,
        HostError::LoadError { reason, .. } if reason.contains("not found") => StatusCode::NOT_IMPLEMENTED,
        HostError::LoadError { reason, .. } if reason.contains("not running") => StatusCode::SERVICE_UNAVAILABLE,
        HostError::LoadError { .. } => StatusCode::NOT_FOUND,
        HostError::MarshalError { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// `GET /plugins/<id>` — basic metadata (§4.F).
pub async fn plugin_metadata(State(state): State<AppState>, AxumPath(plugin_id): AxumPath<String>) -> Response {
    let lifecycle = state.host.lifecycle();
    let Some((display_name, version)) = lifecycle.metadata(&plugin_id).await else {
        return (StatusCode::NOT_FOUND, "unknown plugin").into_response();
    };
    let running = lifecycle.is_running(&plugin_id).await;
    let schema = lifecycle.schema(&plugin_id).await;
    Json(json!({
        "id": plugin_id,
        "displayName": display_name,
        "version": version,
        "running": running,
        "schema": schema,
    }))
    .into_response()
}

/// `GET /plugins/<id>/config` (§4.F).
pub async fn get_config(State(state): State<AppState>, AxumPath(plugin_id): AxumPath<String>) -> Response {
    match state.host.lifecycle().config(&plugin_id).await {
        Some(config) => Json(config).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown plugin").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdateRequest {
    pub enabled: Option<bool>,
    #[serde(rename = "enableDebug")]
    pub enable_debug: Option<bool>,
    pub configuration: Option<Value>,
}

/// `POST /plugins/<id>/config` — persist config and, on an `enabled` flip,
/// start or stop the plugin (§4.F).
pub async fn post_config(
    State(state): State<AppState>,
    AxumPath(plugin_id): AxumPath<String>,
    Json(update): Json<ConfigUpdateRequest>,
) -> Response {
    let lifecycle = state.host.lifecycle();
    if let Some(configuration) = update.configuration {
        if let Err(error) = lifecycle.update_config(&plugin_id, configuration, update.enable_debug).await {
            return error_response(error);
        }
    }
    if let Some(enabled) = update.enabled {
        if let Err(error) = lifecycle.set_enabled(&plugin_id, enabled).await {
            return error_response(error);
        }
    }
    match lifecycle.config(&plugin_id).await {
        Some(config) => Json(config).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown plugin").into_response(),
    }
}

/// `/plugins/<id>/*rest` — the catch-all HTTP endpoint bridge (§4.F).
///
/// Builds the `{method, path, query, params, body, headers}` envelope,
/// finds the guest-declared endpoint matching `(method, path)`, and hands
/// it to `call_http_handler`. `params` is always empty: guest-declared
/// paths in this implementation are literal, not templated, so there are
/// no path parameters to extract (see DESIGN.md).
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    AxumPath((plugin_id, rest)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = format!("/{rest}");
    let endpoints = state.host.lifecycle().http_endpoints(&plugin_id).await;
    let Some(endpoint) = endpoints
        .iter()
        .find(|e| e.method.eq_ignore_ascii_case(method.as_str()) && e.path == path)
    else {
        return (StatusCode::NOT_FOUND, "no matching plugin endpoint").into_response();
    };

    let request_body = decode_request_body(&headers, &body);
    let envelope = json!({
        "method": method.as_str(),
        "path": path,
        "query": query,
        "params": {},
        "body": request_body,
        "headers": headers_to_json(&headers),
    });

    match state.host.lifecycle().call_http_handler(&plugin_id, &endpoint.handler, envelope).await {
        Ok(response_envelope) => decode_response_envelope(response_envelope),
        Err(error) => error_response(error),
    }
}

fn decode_request_body(headers: &HeaderMap, body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    if is_json_content_type(headers) {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            return value;
        }
    }
    Value::String(String::from_utf8_lossy(body).into_owned())
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

/// Decode a guest's `{statusCode, headers, body}` response envelope.
///
/// Per §4.F: if the response declares `Content-Type: application/json`
/// and `body` is itself a JSON string, the bridge parses that string
/// rather than serializing it again — otherwise a guest that already
/// JSON-encoded its payload would have it encoded a second time.
fn decode_response_envelope(envelope: Value) -> Response {
    let status = envelope
        .get("statusCode")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let response_headers: HashMap<String, String> = envelope
        .get("headers")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let is_json = response_headers
        .get("Content-Type")
        .or_else(|| response_headers.get("content-type"))
        .is_some_and(|v| v.starts_with("application/json"));

    let body_value = envelope.get("body").cloned().unwrap_or(Value::Null);
    let body_bytes: Vec<u8> = match &body_value {
        Value::String(s) if is_json => {
            match serde_json::from_str::<Value>(s) {
                Ok(parsed) => serde_json::to_vec(&parsed).unwrap_or_else(|_| s.clone().into_bytes()),
                Err(_) => s.clone().into_bytes(),
            }
        }
        Value::String(s) => s.clone().into_bytes(),
        Value::Null => Vec::new(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &response_headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            builder = builder.header(name, value);
        }
    }
    builder.body(axum::body::Body::from(body_bytes)).unwrap_or_else(|error| {
        warn!(%error, "failed to build guest HTTP response");
        (StatusCode::INTERNAL_SERVER_ERROR, "malformed guest response").into_response()
    })
}

/// `GET /signalk/v2/api/resources/<type>` (§4.J).
pub async fn resource_list(State(state): State<AppState>, AxumPath(resource_type): AxumPath<String>) -> Response {
    call_provider(&state, state.host.lifecycle().default_resource_provider(&resource_type), "resource_list", json!({ "type": resource_type })).await
}

/// `POST /signalk/v2/api/resources/<type>` — create a new resource,
/// letting the guest assign its id (§4.J).
pub async fn resource_set_new(
    State(state): State<AppState>,
    AxumPath(resource_type): AxumPath<String>,
    Json(value): Json<Value>,
) -> Response {
    call_provider(
        &state,
        state.host.lifecycle().default_resource_provider(&resource_type),
        "resource_set",
        json!({ "type": resource_type, "id": Value::Null, "value": value }),
    )
    .await
}

/// `GET /signalk/v2/api/resources/<type>/<id>` (§4.J).
pub async fn resource_get(State(state): State<AppState>, AxumPath((resource_type, resource_id)): AxumPath<(String, String)>) -> Response {
    call_provider(
        &state,
        state.host.lifecycle().default_resource_provider(&resource_type),
        "resource_get",
        json!({ "type": resource_type, "id": resource_id }),
    )
    .await
}

/// `PUT /signalk/v2/api/resources/<type>/<id>` (§4.J).
pub async fn resource_set(
    State(state): State<AppState>,
    AxumPath((resource_type, resource_id)): AxumPath<(String, String)>,
    Json(value): Json<Value>,
) -> Response {
    call_provider(
        &state,
        state.host.lifecycle().default_resource_provider(&resource_type),
        "resource_set",
        json!({ "type": resource_type, "id": resource_id, "value": value }),
    )
    .await
}

/// `DELETE /signalk/v2/api/resources/<type>/<id>` (§4.J).
pub async fn resource_delete(State(state): State<AppState>, AxumPath((resource_type, resource_id)): AxumPath<(String, String)>) -> Response {
    call_provider(
        &state,
        state.host.lifecycle().default_resource_provider(&resource_type),
        "resource_delete",
        json!({ "type": resource_type, "id": resource_id }),
    )
    .await
}

/// `GET /signalk/v2/api/weather/_providers` (§4.J).
pub async fn weather_providers(State(state): State<AppState>) -> Response {
    let providers = state.host.lifecycle().providers().weather.all_providers("default");
    Json(providers).into_response()
}

/// `GET /signalk/v2/api/weather/observations` (§4.J).
pub async fn weather_observations(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    call_provider(&state, state.host.lifecycle().default_weather_provider(), "weather_get_observations", json!(query)).await
}

/// `GET /signalk/v2/api/weather/forecasts/daily` (§4.J). Both forecast
/// routes share one guest export, `weather_get_forecasts`, distinguished
/// by a `kind` field in the request payload (§6 lists the two HTTP paths
/// but only one export name).
pub async fn weather_forecasts_daily(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    let mut payload = json!(query);
    payload["kind"] = json!("daily");
    call_provider(&state, state.host.lifecycle().default_weather_provider(), "weather_get_forecasts", payload).await
}

/// `GET /signalk/v2/api/weather/forecasts/point` (§4.J).
pub async fn weather_forecasts_point(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    let mut payload = json!(query);
    payload["kind"] = json!("point");
    call_provider(&state, state.host.lifecycle().default_weather_provider(), "weather_get_forecasts", payload).await
}

/// `GET /signalk/v2/api/weather/warnings` (§4.J).
pub async fn weather_warnings(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    call_provider(&state, state.host.lifecycle().default_weather_provider(), "weather_get_warnings", json!(query)).await
}

/// `GET /signalk/v2/api/vessels/self/radars` — ids are cached from the
/// owning plugins' `radar_get_radars` export at start time, so this
/// doesn't need to call into any guest (§4.I, §4.J).
pub async fn radar_list(State(state): State<AppState>) -> Response {
    Json(state.host.lifecycle().all_radar_ids().await).into_response()
}

/// `GET /signalk/v2/api/vessels/self/radars/<id>` (§4.J).
pub async fn radar_info(State(state): State<AppState>, AxumPath(radar_id): AxumPath<String>) -> Response {
    call_provider(&state, state.host.lifecycle().radar_owner(&radar_id).await, "radar_get_info", json!({ "radarId": radar_id })).await
}

/// `{GET,PUT,POST} /signalk/v2/api/vessels/self/radars/<id>/<control>` —
/// the optional radar mutators (`setPower/setRange/setGain/setSea/setRain/
/// setControls`). Each is checked independently for export presence: a
/// provider exposing `setGain` but not `setControls` still serves `gain`
/// PUTs (§9 Open Question resolution).
pub async fn radar_control(
    State(state): State<AppState>,
    AxumPath((radar_id, control)): AxumPath<(String, String)>,
    body: Bytes,
) -> Response {
    let Some(plugin_id) = state.host.lifecycle().radar_owner(&radar_id).await else {
        return (StatusCode::NOT_FOUND, "unknown radar id").into_response();
    };
    let export_name = format!("set{}{}", control[..1].to_uppercase(), &control[1..]);
    let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    match state
        .host
        .lifecycle()
        .call_named_export(&plugin_id, &export_name, json!({ "radarId": radar_id, "value": value }))
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(error) => error_response(error),
    }
}

/// Shared helper for every provider-backed handler above: resolve the
/// provider plugin for `lookup_key`, call `export_name` with `payload`,
/// and marshal the JSON result (or the absence of a provider) into a
/// response.
async fn call_provider(state: &AppState, provider: Option<String>, export_name: &str, payload: Value) -> Response {
    let Some(plugin_id) = provider else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no provider registered").into_response();
    };
    match state.host.lifecycle().call_named_export(&plugin_id, export_name, payload).await {
        Ok(result) => Json(result).into_response(),
        Err(error) => error_response(error),
    }
}
