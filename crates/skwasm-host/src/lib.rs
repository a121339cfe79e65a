//! Sandboxed WebAssembly plugin host for a marine-data event server.
//!
//! This crate is a library embedded by an out-of-scope server, not a
//! standalone binary: the embedding server supplies a `HostConfig` and an
//! implementation of `runtime::imports::HostCollaborators` (the
//! `handle_delta` sink, `read_path` query, and status-reporting surface the
//! spec names as external collaborators), and gets back a `Host` it can
//! register packages against and mount an `axum::Router` from.
//!
//! The pieces, leaves first: `capability` (the permission set checked on
//! every privileged FFI call), `vfs` (per-plugin isolated directory tree),
//! `runtime` (module loading, ABI dialect normalization, host imports),
//! `socket` and `stream` (UDP and binary WebSocket fan-out), `delta` (the
//! subscription router), `providers` (PUT/resource/weather/radar
//! registries), `lifecycle` (the state machine tying all of the above
//! together), and `http` (the HTTP bridge and hybrid interceptors). `Host`
//! is the facade over `lifecycle::LifecycleManager` that the embedding
//! server actually talks to.

pub mod capability;
pub mod config;
pub mod delta;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod manifest;
pub mod providers;
pub mod runtime;
pub mod scheduler;
pub mod socket;
pub mod stream;
pub mod vfs;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::sync::RwLock;

pub use config::HostConfig;
pub use error::HostError;
pub use error::HostResult;

use delta::Delta;
use http::interceptors::InterceptorKind;
use http::interceptors::InterceptorTable;
use lifecycle::LifecycleManager;
use lifecycle::PluginHealth;
use lifecycle::PluginSnapshot;
use runtime::imports::HostCollaborators;

/// Facade the embedding server holds onto: one per running host process.
///
/// Cheap to clone via `Arc<Host>` — every field is itself an `Arc` or a
/// lock around shared state, following the same sharing pattern
/// `LifecycleManager` uses internally for its plugin records.
pub struct Host {
    config: HostConfig,
    lifecycle: Arc<LifecycleManager>,
    interceptors: RwLock<InterceptorTable>,
}

impl Host {
    /// Construct a host. `collaborators` wires the handful of hooks the
    /// spec treats as external (delta sink, path reads, status reporting)
    /// back into the embedding server.
    pub fn new(config: HostConfig, collaborators: Arc<dyn HostCollaborators>) -> Arc<Self> {
        let lifecycle = Arc::new(LifecycleManager::new(config.clone(), collaborators));
        Arc::new(Self {
            config,
            lifecycle,
            interceptors: RwLock::new(InterceptorTable::new()),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Register a plugin package directory (must contain `package.json`),
    /// starting it immediately if its persisted configuration has
    /// `enabled: true`.
    pub async fn register(self: &Arc<Self>, package_dir: &Path) -> HostResult<String> {
        self.lifecycle.register(package_dir).await
    }

    /// Publish a delta onto the subscription router, delivering it to
    /// every currently-matching, currently-running subscriber.
    pub async fn publish_delta(self: &Arc<Self>, delta: Delta) {
        self.lifecycle.publish_delta(delta).await;
    }

    /// Stop every registered plugin (supplemental feature: graceful
    /// shutdown of the whole host, e.g. on server process exit).
    pub async fn shutdown_all(self: &Arc<Self>) {
        self.lifecycle.shutdown_all().await;
    }

    /// Registry-wide snapshot of every registered plugin.
    pub async fn snapshot(&self) -> Vec<PluginSnapshot> {
        self.lifecycle.snapshot().await
    }

    /// Cheap health read for one plugin, without touching the guest.
    pub async fn health(&self, plugin_id: &str) -> Option<PluginHealth> {
        self.lifecycle.health(plugin_id).await
    }

    /// Enable the log-viewer hybrid interceptor (`GET /api/logs`) for
    /// `plugin_id` (§4.G). `command` is the log-retrieval subprocess
    /// (argv form, e.g. `["journalctl", "-u", "marine-server", "-n", "50000"]`);
    /// `fallback_file` is read instead if the subprocess exits non-zero or
    /// fails to spawn. Re-registering overwrites the previous entry.
    pub async fn enable_log_viewer_interceptor(&self, plugin_id: &str, command: Vec<String>, fallback_file: Option<PathBuf>) {
        self.interceptors
            .write()
            .await
            .register(plugin_id, InterceptorKind::LogViewer { command, fallback_file });
    }

    /// Enable the charts/tiles hybrid interceptor family (tile serving,
    /// chart upload, chart delete) for `plugin_id` (§4.G).
    pub async fn enable_charts_interceptor(&self, plugin_id: &str) {
        self.interceptors.write().await.register(plugin_id, InterceptorKind::Charts);
    }

    pub(crate) async fn interceptor_for(&self, plugin_id: &str) -> Option<InterceptorKind> {
        self.interceptors.read().await.lookup(plugin_id)
    }

    /// Build the host's `axum::Router`, mounted once at construction time
    /// by the embedding server and never rebuilt as plugins start, stop,
    /// or reload (§4.F design note: all per-plugin variability is resolved
    /// at request time against live lifecycle state, not baked into the
    /// route table).
    pub fn router(self: &Arc<Self>) -> Router {
        http::router(Arc::clone(self))
    }
}
