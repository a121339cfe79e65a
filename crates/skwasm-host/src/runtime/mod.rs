//! Guest runtime: compiling a module, classifying its ABI dialect, and
//! exposing the three dialects behind one `PluginInstance` interface.
//!
//! Every guest call is dispatched to a single-threaded cooperative
//! executor: the host never calls into a guest instance from more than
//! one task concurrently (guarded by the `Mutex<Store<_>>` each
//! `PluginInstance` owns), but two different plugins' instances run
//! fully concurrently with each other.

mod dialect_a;
mod dialect_b;
mod dialect_c;
pub mod imports;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::warn;
use wasmtime::Engine;
use wasmtime::Module;

use crate::capability::Capabilities;
use crate::error::HostError;
use crate::vfs::PluginVfs;

pub use imports::HostImportContext;

/// Which calling convention a guest module implements, detected from its
/// export list at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestDialect {
    /// Loader-style: managed strings marshalled through `__newString` /
    /// `__getString`, typically AssemblyScript-derived guests.
    A,
    /// Explicit allocator: the guest exports `allocate` / `deallocate`
    /// and the host writes raw bytes directly into guest memory.
    B,
    /// Command-style: a single `_start` entry point, after which the
    /// guest's own exports are called directly with primitive arguments.
    C,
}

/// Detect which dialect a compiled module implements by its export
/// surface. Classification happens once, at load time, never per call.
pub fn classify_dialect(module: &Module) -> Result<GuestDialect, String> {
    let exports: Vec<&str> = module.exports().map(|e| e.name()).collect();
    let has = |name: &str| exports.iter().any(|e| *e == name);

    if has("__newString") && has("__getString") {
        Ok(GuestDialect::A)
    } else if has("allocate") && has("deallocate") {
        Ok(GuestDialect::B)
    } else if has("_start") {
        Ok(GuestDialect::C)
    } else {
        Err(format!(
            "module exports neither the loader ({{__newString,__getString}}), \
             allocator ({{allocate,deallocate}}), nor command ({{_start}}) ABI surface; exports seen: {:?}",
            exports
        ))
    }
}

pub fn module_has_export(module: &Module, name: &str) -> bool {
    module.exports().any(|e| e.name() == name)
}

/// A normalized JSON request/response pair crossing the HTTP bridge or an
/// event delivery boundary.
pub type GuestJson = serde_json::Value;

/// Uniform interface over all three ABI dialects. Each dialect module
/// implements marshalling to/from guest linear memory differently; every
/// caller above this trait only ever sees JSON values and byte slices.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn dialect(&self) -> GuestDialect;

    /// True if the guest exports `asyncify_get_state`, meaning the host
    /// may suspend it mid-call at an HTTP fetch boundary and resume later
    /// instead of holding the wall-clock watchdog open the whole time.
    fn supports_asyncify(&self) -> bool;

    /// Call the guest's `start` export with the merged configuration
    /// payload, returning its declared status code.
    async fn call_start(&self, config: GuestJson) -> Result<i32, HostError>;

    async fn call_stop(&self) -> Result<(), HostError>;

    /// Dispatch an HTTP request envelope to a plugin-registered endpoint
    /// handler, returning the response envelope.
    async fn call_http_handler(&self, export_name: &str, request: GuestJson) -> Result<GuestJson, HostError>;

    /// Deliver a delta event to the guest's subscription callback.
    async fn call_on_delta(&self, export_name: &str, delta: GuestJson) -> Result<(), HostError>;

    /// Invoke a PUT/resource/weather/radar mutator export by name with a
    /// JSON payload, returning the guest's JSON result.
    async fn call_json_export(&self, export_name: &str, payload: GuestJson) -> Result<GuestJson, HostError>;

    /// True if the compiled module exports `export_name` at all — used to
    /// decide, e.g., whether a radar provider's `setGain` mutator can be
    /// wired up even though it doesn't export `setControls`.
    fn has_export(&self, export_name: &str) -> bool;

    /// Periodic callback invoked by the poll scheduler, if the guest
    /// exports one.
    async fn call_poll(&self) -> Result<(), HostError>;
}

/// Compiles a module and returns the classified dialect alongside it, the
/// shared entry point every dialect-specific loader goes through.
pub fn load_module(engine: &Engine, wasm_path: &Path) -> Result<(Module, GuestDialect), String> {
    let bytes = std::fs::read(wasm_path).map_err(|e| format!("reading {}: {e}", wasm_path.display()))?;
    let module = Module::new(engine, &bytes).map_err(|e| format!("compiling module: {e}"))?;
    let dialect = classify_dialect(&module)?;
    Ok((module, dialect))
}

/// Instantiate `module` under its classified dialect, wiring capability-gated
/// host imports and a WASI context rooted at the plugin's VFS.
pub fn instantiate(
    engine: &Engine,
    module: Module,
    dialect: GuestDialect,
    plugin_id: &str,
    vfs: &PluginVfs,
    capabilities: Capabilities,
    import_ctx: Arc<HostImportContext>,
    call_timeout: Duration,
) -> Result<Box<dyn PluginInstance>, HostError> {
    match dialect {
        GuestDialect::A => dialect_a::DialectAInstance::instantiate(
            engine, module, plugin_id, vfs, capabilities, import_ctx, call_timeout,
        )
        .map(|i| Box::new(i) as Box<dyn PluginInstance>),
        GuestDialect::B => dialect_b::DialectBInstance::instantiate(
            engine, module, plugin_id, vfs, capabilities, import_ctx, call_timeout,
        )
        .map(|i| Box::new(i) as Box<dyn PluginInstance>),
        GuestDialect::C => dialect_c::DialectCInstance::instantiate(
            engine, module, plugin_id, vfs, capabilities, import_ctx, call_timeout,
        )
        .map(|i| Box::new(i) as Box<dyn PluginInstance>),
    }
}

/// Shared helper: run a blocking guest call under the host's non-preemptive
/// wall-clock watchdog. The call itself cannot be cancelled once started —
/// only the *wait* for it times out, matching §4.F's hang-detection note
/// that a guest stuck in an infinite loop keeps its thread pinned even
/// after the caller gives up on it.
pub(crate) async fn run_with_watchdog<T, F>(
    plugin_id: &str,
    call_timeout: Duration,
    work: F,
) -> Result<T, HostError>
where
    F: FnOnce() -> Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();
    let join = tokio::task::spawn_blocking(work);
    match timeout(call_timeout, join).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(trap))) => {
            warn!(plugin = %plugin_id, %trap, "guest call faulted");
            Err(HostError::RuntimeFault {
                plugin_id: plugin_id.to_string(),
                trap,
            })
        }
        Ok(Err(join_error)) => Err(HostError::RuntimeFault {
            plugin_id: plugin_id.to_string(),
            trap: join_error.to_string(),
        }),
        Err(_) => Err(HostError::Timeout {
            plugin_id: plugin_id.to_string(),
            elapsed_secs: started.elapsed().as_secs(),
        }),
    }
}

/// The Asyncify export name checked to detect suspension support.
pub const ASYNCIFY_STATE_EXPORT: &str = "asyncify_get_state";

#[cfg(test)]
mod tests {
    use super::*;

    // classify_dialect operates purely on a module's export list, which
    // requires a real compiled `Module`; dialect classification is instead
    // exercised indirectly through the dialect-specific unit tests, each of
    // which builds a module exposing exactly its own ABI surface.

    #[test]
    fn asyncify_export_name_matches_spec_constant() {
        assert_eq!(ASYNCIFY_STATE_EXPORT, "asyncify_get_state");
    }
}
