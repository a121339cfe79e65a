//! Plugin lifecycle manager (§4.I): the pivot every other component is
//! wired through. Owns one `PluginRecord` per registered plugin and drives
//! it through `Stopped -> Starting -> Running -> {Stopped, Crashed, Error}`,
//! merging persisted configuration on start, tearing resources down in a
//! single step on stop, and running the crash/backoff/hard-disable state
//! machine on an uncaught guest fault.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;
use wasmtime::Engine;

use crate::capability::Capabilities;
use crate::config::HostConfig;
use crate::delta::Delta;
use crate::delta::DeltaRouter;
use crate::error::HostError;
use crate::manifest::derive_plugin_id;
use crate::manifest::PackageMetadata;
use crate::manifest::PluginConfigFile;
use crate::providers::ProviderRegistries;
use crate::runtime;
use crate::runtime::imports::HostCollaborators;
use crate::runtime::GuestJson;
use crate::runtime::HostImportContext;
use crate::runtime::PluginInstance;
use crate::scheduler::PluginScheduling;
use crate::scheduler::RestartDecision;
use crate::socket::SocketManager;
use crate::stream::StreamManager;
use crate::vfs::PluginVfs;

/// Lifecycle state (§3). `state` and the legacy `status` field on
/// `PluginSnapshot` always mirror each other because both are derived from
/// this single field rather than tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Stopped,
    Starting,
    Running,
    Error,
    Crashed,
}

/// One HTTP endpoint a plugin declared via its `http_endpoints` export.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpEndpointDef {
    pub method: String,
    pub path: String,
    pub handler: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginHealth {
    pub healthy: bool,
    pub message: String,
}

/// Registry-wide view of one plugin, returned by `snapshot` (supplemental
/// feature: registry-wide snapshot).
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub plugin_id: String,
    pub display_name: String,
    pub version: String,
    pub state: PluginState,
    pub status: PluginState,
    pub error_message: Option<String>,
    pub enabled: bool,
    pub crash_count: usize,
}

struct PluginRecord {
    plugin_id: String,
    display_name: String,
    version: String,
    wasm_path: PathBuf,
    capabilities: Capabilities,
    config: PluginConfigFile,
    state: PluginState,
    error_message: Option<String>,
    crash_count: usize,
    last_crash: Option<Instant>,
    schema: Option<serde_json::Value>,
    http_endpoints: Vec<HttpEndpointDef>,
    vfs: PluginVfs,
    sockets: Arc<SocketManager>,
    streams: Arc<StreamManager>,
    import_ctx: Arc<HostImportContext>,
    instance: Option<Box<dyn PluginInstance>>,
    scheduling: PluginScheduling,
    restart_timer: Option<JoinHandle<()>>,
}

/// Owns every registered plugin and the shared, host-wide collaborators
/// they're wired against.
pub struct LifecycleManager {
    config: HostConfig,
    engine: Engine,
    collaborators: Arc<dyn HostCollaborators>,
    delta_router: Arc<DeltaRouter>,
    providers: Arc<ProviderRegistries>,
    plugins: RwLock<HashMap<String, Arc<AsyncMutex<PluginRecord>>>>,
    /// Which plugin owns a given radar id, as declared by that plugin's
    /// `radar_get_radars` export at start time. The binary stream id
    /// `radars/<radar_id>` resolves through this map to the plugin whose
    /// `StreamManager` actually holds the connected clients (§4.E, §4.J).
    radar_owners: RwLock<HashMap<String, String>>,
}

impl LifecycleManager {
    pub fn new(config: HostConfig, collaborators: Arc<dyn HostCollaborators>) -> Self {
        Self {
            config,
            engine: Engine::default(),
            collaborators,
            delta_router: Arc::new(DeltaRouter::new()),
            providers: Arc::new(ProviderRegistries::new()),
            plugins: RwLock::new(HashMap::new()),
            radar_owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn delta_router(&self) -> &Arc<DeltaRouter> {
        &self.delta_router
    }

    pub fn providers(&self) -> &Arc<ProviderRegistries> {
        &self.providers
    }

    async fn record_handle(&self, plugin_id: &str) -> Result<Arc<AsyncMutex<PluginRecord>>, HostError> {
        let plugins = self.plugins.read().await;
        plugins
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| HostError::LoadError {
                plugin_id: plugin_id.to_string(),
                reason: "unknown plugin id".to_string(),
            })
    }

    /// Register a plugin from its package directory: reads package
    /// metadata, derives its `plugin_id`, prepares its VFS, loads its
    /// persisted config, and wires the per-plugin resource managers.
    /// Starts the plugin immediately if its persisted config says it's
    /// enabled (§4.I "Registration").
    pub async fn register(self: &Arc<Self>, package_dir: &Path) -> Result<String, HostError> {
        let metadata_path = package_dir.join("package.json");
        let contents = std::fs::read_to_string(&metadata_path).map_err(|e| HostError::Io {
            plugin_id: "unregistered".to_string(),
            source: e,
        })?;
        let metadata: PackageMetadata = serde_json::from_str(&contents).map_err(|e| HostError::LoadError {
            plugin_id: "unregistered".to_string(),
            reason: format!("parsing package metadata: {e}"),
        })?;

        let plugin_id = derive_plugin_id(&metadata.name);
        let wasm_path = package_dir.join(&metadata.wasm_manifest);
        let capabilities = Capabilities::from_manifest_value(metadata.wasm_capabilities.as_ref());
        let exec_allowlist_patterns = Capabilities::exec_allowlist_patterns(metadata.wasm_capabilities.as_ref());

        let vfs = PluginVfs::new(&self.config.config_root, &plugin_id);
        vfs.ensure_directories().map_err(|e| HostError::Io {
            plugin_id: plugin_id.clone(),
            source: e,
        })?;
        vfs.migrate_legacy_files().map_err(|e| HostError::Io {
            plugin_id: plugin_id.clone(),
            source: e,
        })?;

        let config = PluginConfigFile::load_or_default(&vfs.config_file_path()).map_err(|e| HostError::Io {
            plugin_id: plugin_id.clone(),
            source: e,
        })?;

        let sockets = Arc::new(SocketManager::new(plugin_id.clone()));
        let streams = Arc::new(StreamManager::new(plugin_id.clone()));
        let import_ctx = Arc::new(HostImportContext::new(
            plugin_id.clone(),
            capabilities,
            Arc::clone(&self.delta_router),
            Arc::clone(&self.providers),
            Arc::clone(&sockets),
            Arc::clone(&streams),
            Arc::clone(&self.collaborators),
            &exec_allowlist_patterns,
        ));

        let enabled = config.enabled;
        let record = PluginRecord {
            plugin_id: plugin_id.clone(),
            display_name: metadata.name.clone(),
            version: metadata.version.clone(),
            wasm_path,
            capabilities,
            config,
            state: PluginState::Stopped,
            error_message: None,
            crash_count: 0,
            last_crash: None,
            schema: None,
            http_endpoints: Vec::new(),
            vfs,
            sockets,
            streams,
            import_ctx,
            instance: None,
            scheduling: PluginScheduling::new(plugin_id.clone()),
            restart_timer: None,
        };

        {
            let mut plugins = self.plugins.write().await;
            plugins.insert(plugin_id.clone(), Arc::new(AsyncMutex::new(record)));
        }
        info!(plugin = %plugin_id, "plugin registered");

        if enabled {
            self.start(&plugin_id).await?;
        }
        Ok(plugin_id)
    }

    /// Instantiate the guest, call its `start` export with the merged
    /// config + `enableDebug` payload, and query its declared schema and
    /// HTTP endpoints if it exports them.
    ///
    /// Resets the crash backoff window on success — callers that start a
    /// plugin on purpose (registration, `set_enabled`, config updates,
    /// reload) go through this path.
    pub async fn start(self: &Arc<Self>, plugin_id: &str) -> Result<(), HostError> {
        self.start_internal(plugin_id, false).await
    }

    /// Shared implementation behind `start()` and the scheduler's
    /// crash-triggered auto-restart (`arm_restart`). `restart` distinguishes
    /// the two: a crash-triggered restart must NOT reset the backoff
    /// tracker on success, or the sliding crash window never accumulates
    /// more than one entry and the hard-disable threshold (§4.I) becomes
    /// unreachable.
    async fn start_internal(self: &Arc<Self>, plugin_id: &str, restart: bool) -> Result<(), HostError> {
        let handle = self.record_handle(plugin_id).await?;
        let mut record = handle.lock().await;

        record.error_message = None;
        record.state = PluginState::Starting;

        let (module, dialect) = runtime::load_module(&self.engine, &record.wasm_path).map_err(|reason| {
            HostError::LoadError {
                plugin_id: plugin_id.to_string(),
                reason,
            }
        })?;

        let instance = runtime::instantiate(
            &self.engine,
            module,
            dialect,
            plugin_id,
            &record.vfs,
            record.capabilities,
            Arc::clone(&record.import_ctx),
            self.config.http_watchdog,
        );
        let instance = match instance {
            Ok(instance) => instance,
            Err(error) => {
                record.state = PluginState::Error;
                record.error_message = Some(error.to_string());
                return Err(error);
            }
        };

        let payload = record.config.merged_start_payload();
        match instance.call_start(payload).await {
            Ok(0) => {
                if instance.has_export("plugin_schema") {
                    if let Ok(schema) = instance.call_json_export("plugin_schema", GuestJson::Null).await {
                        record.schema = Some(schema);
                    }
                }
                if instance.has_export("http_endpoints") {
                    if let Ok(endpoints) = instance.call_json_export("http_endpoints", GuestJson::Null).await {
                        record.http_endpoints = serde_json::from_value(endpoints).unwrap_or_default();
                    }
                }
                if instance.has_export("radar_get_radars") {
                    if let Ok(GuestJson::Array(ids)) = instance.call_json_export("radar_get_radars", GuestJson::Null).await {
                        let mut owners = self.radar_owners.write().await;
                        for id in ids.into_iter().filter_map(|v| v.as_str().map(str::to_string)) {
                            owners.insert(id, plugin_id.to_string());
                        }
                    }
                }
                record.state = PluginState::Running;
                if !restart {
                    record.scheduling.backoff.reset().await;
                    record.crash_count = 0;
                }
                let has_poll = instance.has_export("poll");
                record.instance = Some(instance);
                if let Some(previous) = record.restart_timer.take() {
                    previous.abort();
                }
                drop(record);
                if has_poll {
                    self.arm_poll(plugin_id).await;
                }
                info!(plugin = %plugin_id, "plugin started");
                Ok(())
            }
            Ok(code) => {
                record.state = PluginState::Error;
                record.error_message = Some(format!("start returned non-zero code {code}"));
                Err(HostError::StartFailed {
                    plugin_id: plugin_id.to_string(),
                    code,
                })
            }
            Err(error) => {
                record.state = PluginState::Error;
                record.error_message = Some(error.to_string());
                Err(error)
            }
        }
    }

    async fn arm_poll(self: &Arc<Self>, plugin_id: &str) {
        let Ok(handle) = self.record_handle(plugin_id).await else {
            return;
        };
        let interval = self.config.poll_interval;
        let manager = Arc::clone(self);
        let plugin_id = plugin_id.to_string();
        let record = handle.lock().await;
        record
            .scheduling
            .poll
            .start(interval, move || {
                let manager = Arc::clone(&manager);
                let plugin_id = plugin_id.clone();
                async move { manager.poll_once(&plugin_id).await }
            })
            .await;
    }

    async fn poll_once(self: &Arc<Self>, plugin_id: &str) {
        let Ok(handle) = self.record_handle(plugin_id).await else {
            return;
        };
        let record = handle.lock().await;
        if record.state != PluginState::Running {
            return;
        }
        let Some(instance) = record.instance.as_ref() else {
            return;
        };
        let result = instance.call_poll().await;
        drop(record);
        if let Err(error) = result {
            self.on_fault(plugin_id, error).await;
        }
    }

    /// Stop a plugin: call its `stop` export (best-effort), then release
    /// every resource it held in a single step (§5 invariant 3) and cancel
    /// any pending restart timer.
    pub async fn stop(self: &Arc<Self>, plugin_id: &str) -> Result<(), HostError> {
        let handle = self.record_handle(plugin_id).await?;
        let mut record = handle.lock().await;
        if let Some(instance) = record.instance.as_ref() {
            if let Err(error) = instance.call_stop().await {
                warn!(plugin = %plugin_id, %error, "guest stop export failed; continuing teardown");
            }
        }
        self.release_resources(&mut record).await;
        if let Err(error) = record.vfs.cleanup_tmp() {
            warn!(plugin = %plugin_id, %error, "failed to clean up plugin tmp directory");
        }
        record.state = PluginState::Stopped;
        info!(plugin = %plugin_id, "plugin stopped");
        Ok(())
    }

    /// Release every resource a running plugin holds: its guest instance,
    /// sockets, streams, provider/PUT registrations, and poll/restart
    /// timers. Leaves persisted config and subscriptions untouched.
    async fn release_resources(&self, record: &mut PluginRecord) {
        record.scheduling.poll.stop().await;
        if let Some(timer) = record.restart_timer.take() {
            timer.abort();
        }
        record.sockets.close_all().await;
        record.streams.close_all().await;
        self.providers.unregister_all_for_plugin(&record.plugin_id);
        self.radar_owners.write().await.retain(|_, owner| owner != &record.plugin_id);
        record.instance = None;
    }

    /// Hot-reload a running plugin: buffer matching deltas for the
    /// duration of the stop/start cycle rather than dropping them, then
    /// replay them in order once the new instance is running (§5 ordering
    /// guarantee, §8 property 3). Subscriptions and persisted config
    /// survive the reload; guest linear memory does not.
    pub async fn reload(self: &Arc<Self>, plugin_id: &str) -> Result<(), HostError> {
        let was_running = {
            let handle = self.record_handle(plugin_id).await?;
            let record = handle.lock().await;
            record.state == PluginState::Running
        };

        self.delta_router.begin_reload(plugin_id);
        if was_running {
            self.stop(plugin_id).await?;
            self.start(plugin_id).await?;
        }
        let buffered = self.delta_router.end_reload(plugin_id);
        for delta in buffered {
            self.deliver_delta(plugin_id, delta).await;
        }
        Ok(())
    }

    /// Publish a delta to every subscribed, non-reloading plugin.
    pub async fn publish_delta(self: &Arc<Self>, delta: Delta) {
        let plugin_ids = self.delta_router.publish(delta.clone());
        for plugin_id in plugin_ids {
            self.deliver_delta(&plugin_id, delta.clone()).await;
        }
    }

    async fn deliver_delta(self: &Arc<Self>, plugin_id: &str, delta: Delta) {
        let Ok(handle) = self.record_handle(plugin_id).await else {
            return;
        };
        let record = handle.lock().await;
        if record.state != PluginState::Running {
            return;
        }
        let Some(instance) = record.instance.as_ref() else {
            return;
        };
        if !instance.has_export("handle_delta") {
            return;
        }
        let payload = serde_json::json!({
            "context": delta.context,
            "path": delta.path,
            "value": delta.value,
            "timestamp": delta.timestamp_ms,
        });
        let result = instance.call_on_delta("handle_delta", payload).await;
        drop(record);
        if let Err(error) = result {
            self.on_fault(plugin_id, error).await;
        }
    }

    /// Invoke a named export with a JSON payload on a running plugin,
    /// shared by the HTTP bridge, PUT dispatch, and resource/weather/radar
    /// provider lookups — everything that calls "some named export with a
    /// JSON in, JSON out" shape goes through here.
    pub async fn call_named_export(
        self: &Arc<Self>,
        plugin_id: &str,
        export_name: &str,
        payload: GuestJson,
    ) -> Result<GuestJson, HostError> {
        let handle = self.record_handle(plugin_id).await?;
        let record = handle.lock().await;
        if record.state != PluginState::Running {
            return Err(HostError::LoadError {
                plugin_id: plugin_id.to_string(),
                reason: "plugin not running".to_string(),
            });
        }
        let Some(instance) = record.instance.as_ref() else {
            return Err(HostError::LoadError {
                plugin_id: plugin_id.to_string(),
                reason: "no live instance".to_string(),
            });
        };
        if !instance.has_export(export_name) {
            return Err(HostError::LoadError {
                plugin_id: plugin_id.to_string(),
                reason: format!("export '{export_name}' not found"),
            });
        }
        let result = instance.call_json_export(export_name, payload).await;
        drop(record);
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                if matches!(error, HostError::RuntimeFault { .. }) {
                    self.on_fault(plugin_id, error).await;
                    Err(HostError::RuntimeFault {
                        plugin_id: plugin_id.to_string(),
                        trap: "guest faulted; see host logs".to_string(),
                    })
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Dispatch an HTTP request envelope to a plugin-registered handler
    /// export, sharing the same underlying call path as PUT/provider
    /// dispatch (§4.F).
    pub async fn call_http_handler(
        self: &Arc<Self>,
        plugin_id: &str,
        handler: &str,
        request: GuestJson,
    ) -> Result<GuestJson, HostError> {
        self.call_named_export(plugin_id, handler, request).await
    }

    /// Fan a PUT request out to every plugin registered against
    /// `(context, path)`, invoking the synthesized export name for each
    /// (§4.I design note: the registration table tracks *who* to call; the
    /// export name is still synthesized at call time).
    pub async fn dispatch_put(
        self: &Arc<Self>,
        context: &str,
        path: &str,
        value: serde_json::Value,
    ) -> Vec<(String, GuestJson)> {
        let plugin_ids = self.providers.put_handlers.lookup(context, path);
        let export_name = synthesize_put_handler_name(context, path);
        let mut results = Vec::with_capacity(plugin_ids.len());
        for plugin_id in plugin_ids {
            let outcome = match self.call_named_export(&plugin_id, &export_name, value.clone()).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(plugin = %plugin_id, %error, export = %export_name, "put handler dispatch failed");
                    serde_json::json!({ "state": "COMPLETED", "statusCode": 501, "message": error.to_string() })
                }
            };
            results.push((plugin_id, outcome));
        }
        results
    }

    /// Enable or disable a plugin, starting or stopping it to match.
    pub async fn set_enabled(self: &Arc<Self>, plugin_id: &str, enabled: bool) -> Result<(), HostError> {
        let handle = self.record_handle(plugin_id).await?;
        let currently_running = {
            let mut record = handle.lock().await;
            record.config.enabled = enabled;
            record.config.save(&record.vfs.config_file_path()).map_err(|e| HostError::Io {
                plugin_id: plugin_id.to_string(),
                source: e,
            })?;
            record.state == PluginState::Running
        };
        if enabled && !currently_running {
            self.start(plugin_id).await?;
        } else if !enabled && currently_running {
            self.stop(plugin_id).await?;
        }
        Ok(())
    }

    /// Persist a new configuration object (and optionally `enableDebug`),
    /// restarting the plugin if it's currently running so the new config
    /// takes effect via a normal stop-then-start (§4.I "Config update").
    pub async fn update_config(
        self: &Arc<Self>,
        plugin_id: &str,
        configuration: serde_json::Value,
        enable_debug: Option<bool>,
    ) -> Result<(), HostError> {
        let handle = self.record_handle(plugin_id).await?;
        let was_running = {
            let mut record = handle.lock().await;
            record.config.configuration = configuration;
            if let Some(debug) = enable_debug {
                record.config.enable_debug = debug;
            }
            record.config.save(&record.vfs.config_file_path()).map_err(|e| HostError::Io {
                plugin_id: plugin_id.to_string(),
                source: e,
            })?;
            record.state == PluginState::Running
        };
        if was_running {
            self.stop(plugin_id).await?;
            self.start(plugin_id).await?;
        }
        Ok(())
    }

    /// Enter the crash pathway: release resources, record the crash
    /// against the backoff tracker, and either schedule a restart (with
    /// exponential backoff) or hard-disable the plugin if it crashed more
    /// than `max_crashes_in_window` times within `crash_window` (§4.I).
    async fn on_fault(self: &Arc<Self>, plugin_id: &str, error: HostError) {
        if !matches!(error, HostError::RuntimeFault { .. }) {
            warn!(plugin = %plugin_id, %error, "guest call failed");
            return;
        }
        warn!(plugin = %plugin_id, %error, "guest faulted, entering crash pathway");

        let Ok(handle) = self.record_handle(plugin_id).await else {
            return;
        };
        let mut record = handle.lock().await;
        self.release_resources(&mut record).await;
        record.state = PluginState::Crashed;
        record.error_message = Some(error.to_string());
        record.crash_count += 1;
        record.last_crash = Some(Instant::now());

        let decision = record.scheduling.backoff.record_crash(Instant::now()).await;
        match decision {
            RestartDecision::Immediate => self.arm_restart(plugin_id, Duration::ZERO, &mut record),
            RestartDecision::After(delay) => self.arm_restart(plugin_id, delay, &mut record),
            RestartDecision::Disable => {
                record.state = PluginState::Error;
                record.error_message = Some(
                    "disabled after repeated crashes within the crash window".to_string(),
                );
            }
        }
    }

    fn arm_restart(self: &Arc<Self>, plugin_id: &str, delay: Duration, record: &mut PluginRecord) {
        let manager = Arc::clone(self);
        let plugin_id = plugin_id.to_string();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(error) = manager.start_internal(&plugin_id, true).await {
                warn!(plugin = %plugin_id, %error, "scheduled restart failed");
            }
        });
        if let Some(previous) = record.restart_timer.replace(handle) {
            previous.abort();
        }
    }

    /// Registry-wide snapshot of every registered plugin (supplemental
    /// feature 2).
    pub async fn snapshot(&self) -> Vec<PluginSnapshot> {
        let plugins = self.plugins.read().await;
        let mut out = Vec::with_capacity(plugins.len());
        for handle in plugins.values() {
            let record = handle.lock().await;
            out.push(PluginSnapshot {
                plugin_id: record.plugin_id.clone(),
                display_name: record.display_name.clone(),
                version: record.version.clone(),
                state: record.state,
                status: record.state,
                error_message: record.error_message.clone(),
                enabled: record.config.enabled,
                crash_count: record.crash_count,
            });
        }
        out
    }

    /// Per-plugin health snapshot (supplemental feature 1): cheap enough
    /// to poll from an external monitor without touching the guest.
    pub async fn health(&self, plugin_id: &str) -> Option<PluginHealth> {
        let handle = self.record_handle(plugin_id).await.ok()?;
        let record = handle.lock().await;
        Some(match record.state {
            PluginState::Running => PluginHealth {
                healthy: true,
                message: "running".to_string(),
            },
            PluginState::Starting => PluginHealth {
                healthy: true,
                message: "starting".to_string(),
            },
            PluginState::Stopped => PluginHealth {
                healthy: true,
                message: "stopped".to_string(),
            },
            PluginState::Crashed | PluginState::Error => PluginHealth {
                healthy: false,
                message: record
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unhealthy".to_string()),
            },
        })
    }

    pub async fn http_endpoints(&self, plugin_id: &str) -> Vec<HttpEndpointDef> {
        match self.record_handle(plugin_id).await {
            Ok(handle) => handle.lock().await.http_endpoints.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn schema(&self, plugin_id: &str) -> Option<serde_json::Value> {
        let handle = self.record_handle(plugin_id).await.ok()?;
        handle.lock().await.schema.clone()
    }

    pub async fn is_running(&self, plugin_id: &str) -> bool {
        match self.record_handle(plugin_id).await {
            Ok(handle) => handle.lock().await.state == PluginState::Running,
            Err(_) => false,
        }
    }

    /// Stop every registered plugin, releasing all resources (supplemental
    /// feature 3: `Host::shutdown_all`).
    pub async fn shutdown_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(error) = self.stop(&id).await {
                warn!(plugin = %id, %error, "error stopping plugin during shutdown");
            }
        }
    }

    /// The persisted configuration file for a plugin (§4.F config endpoints).
    pub async fn config(&self, plugin_id: &str) -> Option<PluginConfigFile> {
        let handle = self.record_handle(plugin_id).await.ok()?;
        Some(handle.lock().await.config.clone())
    }

    /// Display name / version metadata surfaced by `GET /plugins/<id>`.
    pub async fn metadata(&self, plugin_id: &str) -> Option<(String, String)> {
        let handle = self.record_handle(plugin_id).await.ok()?;
        let record = handle.lock().await;
        Some((record.display_name.clone(), record.version.clone()))
    }

    /// `StreamManager` owning the binary stream `stream_id`, resolved
    /// through the radar-id ownership map for the `radars/<id>` convention
    /// (§4.E). Returns `None` for stream ids this host cannot attribute to
    /// a running plugin.
    pub async fn stream_manager_for(&self, stream_id: &str) -> Option<Arc<StreamManager>> {
        let radar_id = stream_id.strip_prefix("radars/")?;
        let plugin_id = self.radar_owners.read().await.get(radar_id).cloned()?;
        let handle = self.record_handle(&plugin_id).await.ok()?;
        let record = handle.lock().await;
        if record.state == PluginState::Running {
            Some(Arc::clone(&record.streams))
        } else {
            None
        }
    }

    /// Default provider plugin for a resource type, or `None` if none is
    /// currently registered (§3 "Provider registry entries").
    pub fn default_resource_provider(&self, resource_type: &str) -> Option<String> {
        self.providers.resources.default_provider(resource_type)
    }

    /// Default weather provider, if one is registered.
    pub fn default_weather_provider(&self) -> Option<String> {
        self.providers.weather.default_provider("default")
    }

    /// Plugin owning `radar_id`, derived from each radar provider's
    /// `radar_get_radars` export at start time.
    pub async fn radar_owner(&self, radar_id: &str) -> Option<String> {
        self.radar_owners.read().await.get(radar_id).cloned()
    }

    /// All radar ids currently attributed to a running provider, across
    /// every registered radar plugin — backs `GET /signalk/v2/api/vessels/self/radars`.
    pub async fn all_radar_ids(&self) -> Vec<String> {
        self.radar_owners.read().await.keys().cloned().collect()
    }

    /// The charts/tile-container storage directory for a plugin, created
    /// on demand — used by the charts hybrid interceptor, which reads and
    /// writes this directory directly rather than crossing into the guest
    /// (§4.G).
    pub async fn charts_dir(&self, plugin_id: &str) -> Option<PathBuf> {
        let handle = self.record_handle(plugin_id).await.ok()?;
        let dir = handle.lock().await.vfs.charts_dir();
        std::fs::create_dir_all(&dir).ok()?;
        Some(dir)
    }
}

fn synthesize_put_handler_name(context: &str, path: &str) -> String {
    format!(
        "handle_put_{}_{}",
        context.replace('.', "_"),
        path.replace('.', "_")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_handler_name_synthesis_matches_documented_convention() {
        assert_eq!(
            synthesize_put_handler_name("vessels.self", "navigation.anchor.position"),
            "handle_put_vessels_self_navigation_anchor_position"
        );
    }

    #[tokio::test]
    async fn health_for_unknown_plugin_is_none() {
        let manager = Arc::new(LifecycleManager::new(
            HostConfig::default(),
            Arc::new(crate::runtime::imports::NullCollaborators),
        ));
        assert!(manager.health("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_empty_before_any_registration() {
        let manager = Arc::new(LifecycleManager::new(
            HostConfig::default(),
            Arc::new(crate::runtime::imports::NullCollaborators),
        ));
        assert!(manager.snapshot().await.is_empty());
    }
}
