//! Hybrid interceptors (§4.G): host-side short-circuits for endpoints
//! whose payloads exceed the guest's safe buffer size. Looked up through
//! a small data-driven table keyed by plugin id rather than hard-coded
//! plugin-id string matches (§9 redesign note) — the two required
//! families, log-viewer and charts/tiles, are the only entries an
//! embedding server registers today via `Host::enable_log_viewer_interceptor`
//! / `Host::enable_charts_interceptor`.
//!
//! Routing: rather than probing this table from inside the generic
//! `/plugins/<id>/*rest` catch-all, each interceptor family is mounted as
//! its own literal route (`/plugins/<id>/api/logs`, `/plugins/<id>/tiles/...`,
//! ...), which `axum`'s router already prefers over the wildcard catch-all
//! for an exact path match. Each handler still consults the table first —
//! a plugin with the family not enabled gets a `404` rather than silently
//! falling through to the guest, since the guest-declared endpoint surface
//! and the interceptor surface are disjoint path namespaces in practice.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use axum::extract::Multipart;
use axum::extract::Path as AxumPath;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::warn;

use crate::http::AppState;

/// One registered hybrid interceptor family for a plugin.
#[derive(Debug, Clone)]
pub enum InterceptorKind {
    /// Large-log streaming (`GET /api/logs`). `command` is the
    /// log-retrieval subprocess (argv form); `fallback_file` is read
    /// instead if the subprocess exits non-zero or fails to spawn.
    LogViewer {
        command: Vec<String>,
        fallback_file: Option<PathBuf>,
    },
    /// Map-tile serving and chart upload/delete.
    Charts,
}

/// Plugin-id-keyed interceptor registry (§9 redesign note (b)).
#[derive(Debug, Default)]
pub struct InterceptorTable {
    entries: HashMap<String, InterceptorKind>,
}

impl InterceptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin_id: &str, kind: InterceptorKind) {
        self.entries.insert(plugin_id.to_string(), kind);
    }

    pub fn lookup(&self, plugin_id: &str) -> Option<InterceptorKind> {
        self.entries.get(plugin_id).cloned()
    }
}

/// `GET /plugins/<id>/api/logs` (§4.G family 1).
pub async fn log_viewer(State(state): State<AppState>, AxumPath(plugin_id): AxumPath<String>) -> Response {
    let Some(InterceptorKind::LogViewer { command, fallback_file }) = state.host.interceptor_for(&plugin_id).await else {
        return (StatusCode::NOT_FOUND, "log viewer not enabled for this plugin").into_response();
    };
    let line_cap = state.host.config().log_viewer_line_cap;
    let (lines, source) = retrieve_log_lines(&command, fallback_file.as_deref(), line_cap).await;
    Json(json!({
        "lines": lines,
        "count": lines.len(),
        "source": source,
        "format": "text",
    }))
    .into_response()
}

async fn retrieve_log_lines(command: &[String], fallback_file: Option<&Path>, line_cap: usize) -> (Vec<String>, &'static str) {
    if let Some((program, args)) = command.split_first() {
        let output = tokio::process::Command::new(program).args(args).output().await;
        if let Ok(output) = output {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                return (text.lines().take(line_cap).map(str::to_string).collect(), "subprocess");
            }
            warn!(%program, status = %output.status, "log-retrieval subprocess exited non-zero; falling back");
        } else {
            warn!(%program, "failed to spawn log-retrieval subprocess; falling back");
        }
    }
    match fallback_file {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(text) => (text.lines().take(line_cap).map(str::to_string).collect(), "fallback-file"),
            Err(error) => {
                warn!(%error, path = %path.display(), "failed to read fallback log file");
                (Vec::new(), "unavailable")
            }
        },
        None => (Vec::new(), "unavailable"),
    }
}

/// `GET /plugins/<id>/tiles/<chart-id>/<z>/<x>/<y>` (§4.G family 2).
///
/// Tiles are read directly from an on-disk tile-container file (an
/// MBTiles-style sqlite database) in the plugin's VFS `charts/`
/// directory, never crossing into the guest. A missing tile is `204`, not
/// `404`, so map clients keep rendering around the gap.
pub async fn tile(
    State(state): State<AppState>,
    AxumPath((plugin_id, chart_id, z, x, y)): AxumPath<(String, String, u32, u32, u32)>,
) -> Response {
    if !matches!(state.host.interceptor_for(&plugin_id).await, Some(InterceptorKind::Charts)) {
        return (StatusCode::NOT_FOUND, "charts interceptor not enabled for this plugin").into_response();
    }
    let Some(charts_dir) = state.host.lifecycle().charts_dir(&plugin_id).await else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no charts directory").into_response();
    };
    let Some(container) = find_container(&charts_dir, &chart_id) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let tms_y = tms_y(z, y);
    let tile = tokio::task::spawn_blocking(move || read_tile(&container, z, x, tms_y)).await;
    match tile {
        Ok(Ok(Some(bytes))) => {
            let content_type = infer::get(&bytes).map(|kind| kind.mime_type()).unwrap_or("application/octet-stream");
            Response::builder()
                .status(StatusCode::OK)
                .header(axum::http::header::CONTENT_TYPE, content_type)
                .body(axum::body::Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(Ok(None)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(error)) => {
            warn!(%error, plugin = %plugin_id, chart = %chart_id, "tile container read failed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(error) => {
            warn!(%error, "tile read task panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// TMS y-axis flip: the tile container stores rows bottom-up, the `y`
/// path segment is top-down XYZ convention.
fn tms_y(z: u32, y: u32) -> u32 {
    (1u32 << z).saturating_sub(1).saturating_sub(y)
}

fn find_container(charts_dir: &Path, chart_id: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(charts_dir).ok()?;
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.file_stem().and_then(|s| s.to_str()) == Some(chart_id))
}

fn read_tile(container: &Path, z: u32, x: u32, tms_y: u32) -> rusqlite::Result<Option<Vec<u8>>> {
    let conn = Connection::open(container)?;
    conn.query_row(
        "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
        rusqlite::params![z, x, tms_y],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .optional()
}

/// `POST /plugins/<id>/api/charts/upload` (§4.G family 2). Expects a
/// `multipart/form-data` body with a `chartId` text field and a `file`
/// field carrying the tile container bytes.
pub async fn chart_upload(State(state): State<AppState>, AxumPath(plugin_id): AxumPath<String>, mut multipart: Multipart) -> Response {
    if !matches!(state.host.interceptor_for(&plugin_id).await, Some(InterceptorKind::Charts)) {
        return (StatusCode::NOT_FOUND, "charts interceptor not enabled for this plugin").into_response();
    }
    let Some(charts_dir) = state.host.lifecycle().charts_dir(&plugin_id).await else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no charts directory").into_response();
    };

    let mut chart_id: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "malformed multipart upload");
                return (StatusCode::BAD_REQUEST, "malformed multipart body").into_response();
            }
        };
        match field.name() {
            Some("chartId") => chart_id = field.text().await.ok(),
            Some("file") => {
                file_name = field.file_name().map(str::to_string);
                file_bytes = field.bytes().await.ok().map(|b| b.to_vec());
            }
            _ => {}
        }
    }

    let (Some(chart_id), Some(bytes)) = (chart_id, file_bytes) else {
        return (StatusCode::BAD_REQUEST, "expected chartId and file fields").into_response();
    };
    let ext = file_name
        .as_deref()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .unwrap_or("mbtiles");
    let dest = charts_dir.join(format!("{chart_id}.{ext}"));
    let staging = charts_dir.join(format!(".upload-{chart_id}.{ext}"));

    let write_result = tokio::task::spawn_blocking({
        let staging = staging.clone();
        let dest = dest.clone();
        move || -> std::io::Result<()> {
            std::fs::write(&staging, &bytes)?;
            std::fs::rename(&staging, &dest)
        }
    })
    .await;
    if !matches!(write_result, Ok(Ok(()))) {
        warn!(plugin = %plugin_id, chart = %chart_id, "failed to stage uploaded chart");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to store chart").into_response();
    }

    let notify = state
        .host
        .lifecycle()
        .call_named_export(
            &plugin_id,
            "resource_set",
            json!({ "type": "charts", "id": chart_id, "value": { "file": dest.file_name().and_then(|n| n.to_str()) } }),
        )
        .await;
    if let Err(error) = notify {
        warn!(%error, plugin = %plugin_id, chart = %chart_id, "guest did not acknowledge chart upload");
    }

    Json(json!({ "chartId": chart_id })).into_response()
}

/// `DELETE /plugins/<id>/api/charts/file/<chart-id>` (§4.G family 2).
pub async fn chart_delete(State(state): State<AppState>, AxumPath((plugin_id, chart_id)): AxumPath<(String, String)>) -> Response {
    if !matches!(state.host.interceptor_for(&plugin_id).await, Some(InterceptorKind::Charts)) {
        return (StatusCode::NOT_FOUND, "charts interceptor not enabled for this plugin").into_response();
    }
    let Some(charts_dir) = state.host.lifecycle().charts_dir(&plugin_id).await else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no charts directory").into_response();
    };
    if let Some(container) = find_container(&charts_dir, &chart_id) {
        if let Err(error) = tokio::fs::remove_file(&container).await {
            warn!(%error, plugin = %plugin_id, chart = %chart_id, "failed to remove chart file");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to remove chart").into_response();
        }
    }
    let notify = state
        .host
        .lifecycle()
        .call_named_export(&plugin_id, "resource_delete", json!({ "type": "charts", "id": chart_id }))
        .await;
    if let Err(error) = notify {
        warn!(%error, plugin = %plugin_id, chart = %chart_id, "guest did not acknowledge chart deletion");
    }
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tms_y_flips_against_zoom_extent() {
        assert_eq!(tms_y(3, 2), 5);
        assert_eq!(tms_y(0, 0), 0);
        assert_eq!(tms_y(4, 0), 15);
    }

    #[test]
    fn interceptor_table_round_trips() {
        let mut table = InterceptorTable::new();
        table.register("charts-provider-x", InterceptorKind::Charts);
        assert!(matches!(table.lookup("charts-provider-x"), Some(InterceptorKind::Charts)));
        assert!(table.lookup("unknown-plugin").is_none());
    }
}
