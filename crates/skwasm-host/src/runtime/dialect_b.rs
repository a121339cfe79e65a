//! Dialect B: explicit allocator.
//!
//! The guest exports `allocate(size) -> ptr` / `deallocate(ptr, size)` and
//! an optional `_initialize` run once right after instantiation. Every
//! string crossing the boundary is written into (for inputs) or read out
//! of (for outputs) a caller-supplied buffer: a json-returning export has
//! the signature `(req_ptr, req_len, out_ptr, out_max) -> i32`, returning
//! the number of bytes written to `out`, or a negative value if `out_max`
//! was too small or the call failed.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use wasmtime::Engine;
use wasmtime::Instance;
use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;
use wasmtime_wasi::preview1::wasi_snapshot_preview1::add_to_linker as add_wasi_to_linker;
use wasmtime_wasi::DirPerms;
use wasmtime_wasi::FilePerms;
use wasmtime_wasi::WasiCtxBuilder;

use super::imports::add_host_imports;
use super::imports::HostImportContext;
use super::imports::PluginStoreData;
use super::run_with_watchdog;
use super::GuestDialect;
use super::GuestJson;
use super::PluginInstance;
use super::ASYNCIFY_STATE_EXPORT;
use crate::capability::Capabilities;
use crate::error::HostError;
use crate::vfs::PluginVfs;

const OUT_BUFFER_SIZE: usize = 64 * 1024;

struct Guest {
    store: StdMutex<Store<PluginStoreData>>,
    instance: Instance,
}

pub struct DialectBInstance {
    plugin_id: String,
    guest: Arc<Guest>,
    module: Module,
    call_timeout: Duration,
}

impl DialectBInstance {
    pub fn instantiate(
        engine: &Engine,
        module: Module,
        plugin_id: &str,
        vfs: &PluginVfs,
        capabilities: Capabilities,
        import_ctx: Arc<HostImportContext>,
        call_timeout: Duration,
    ) -> Result<Self, HostError> {
        let _ = capabilities;
        let mut linker: Linker<PluginStoreData> = Linker::new(engine);
        add_wasi_to_linker(&mut linker, |data: &mut PluginStoreData| &mut data.wasi).map_err(|e| HostError::LoadError {
            plugin_id: plugin_id.to_string(),
            reason: format!("wiring WASI: {e}"),
        })?;
        add_host_imports(&mut linker).map_err(|e| HostError::LoadError {
            plugin_id: plugin_id.to_string(),
            reason: format!("wiring host imports: {e}"),
        })?;

        let mut wasi_builder = WasiCtxBuilder::new();
        wasi_builder
            .preopened_dir(vfs.root(), "/", DirPerms::READ | DirPerms::MUTATE, FilePerms::READ | FilePerms::WRITE)
            .map_err(|e| HostError::LoadError {
                plugin_id: plugin_id.to_string(),
                reason: format!("preopening VFS root: {e}"),
            })?;
        wasi_builder.inherit_stderr();
        let wasi = wasi_builder.build_p1();

        let mut store = Store::new(
            engine,
            PluginStoreData {
                wasi,
                import_ctx: Arc::clone(&import_ctx),
            },
        );
        let instance = linker.instantiate(&mut store, &module).map_err(|e| HostError::LoadError {
            plugin_id: plugin_id.to_string(),
            reason: format!("instantiating module: {e}"),
        })?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ()).map_err(|e| HostError::LoadError {
                plugin_id: plugin_id.to_string(),
                reason: format!("_initialize trapped: {e}"),
            })?;
        }

        Ok(Self {
            plugin_id: plugin_id.to_string(),
            guest: Arc::new(Guest { store: StdMutex::new(store), instance }),
            module,
            call_timeout,
        })
    }

    /// Allocate `len` bytes via the guest's `allocate` export, write
    /// `data` into them, returning the pointer — freed by the caller via
    /// `free_buffer` once the call completes.
    fn write_buffer(guest: &Guest, data: &[u8]) -> Result<i32, String> {
        let mut store = guest.store.lock().expect("dialect B store lock poisoned");
        let allocate = guest
            .instance
            .get_typed_func::<i32, i32>(&mut *store, "allocate")
            .map_err(|e| format!("missing allocate export: {e}"))?;
        let ptr = allocate.call(&mut *store, data.len() as i32).map_err(|e| e.to_string())?;
        let memory = guest
            .instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| "module exports no memory".to_string())?;
        memory.data_mut(&mut *store)[ptr as usize..ptr as usize + data.len()].copy_from_slice(data);
        Ok(ptr)
    }

    fn free_buffer(guest: &Guest, ptr: i32, len: i32) {
        let mut store = guest.store.lock().expect("dialect B store lock poisoned");
        if let Ok(dealloc) = guest.instance.get_typed_func::<(i32, i32), ()>(&mut *store, "deallocate") {
            let _ = dealloc.call(&mut *store, (ptr, len));
        }
    }

    fn read_buffer(guest: &Guest, ptr: i32, len: i32) -> Result<Vec<u8>, String> {
        let mut store = guest.store.lock().expect("dialect B store lock poisoned");
        let memory = guest
            .instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| "module exports no memory".to_string())?;
        let data = memory.data(&mut *store);
        let (ptr, len) = (ptr as usize, len as usize);
        data.get(ptr..ptr + len).map(|s| s.to_vec()).ok_or_else(|| "out-of-bounds read".to_string())
    }

    /// Call a `(req_ptr, req_len, out_ptr, out_max) -> i32` export and
    /// decode the JSON it wrote into the out buffer.
    fn call_buffered_json(guest: &Guest, export: &str, payload: &GuestJson) -> Result<GuestJson, String> {
        let bytes = serde_json::to_vec(payload).map_err(|e| format!("serializing payload: {e}"))?;
        let req_ptr = Self::write_buffer(guest, &bytes)?;
        let out_ptr = Self::write_buffer(guest, &vec![0u8; OUT_BUFFER_SIZE])?;

        let result = {
            let mut store = guest.store.lock().expect("dialect B store lock poisoned");
            let func = guest
                .instance
                .get_typed_func::<(i32, i32, i32, i32), i32>(&mut *store, export)
                .map_err(|e| format!("missing export '{export}': {e}"))?;
            func.call(&mut *store, (req_ptr, bytes.len() as i32, out_ptr, OUT_BUFFER_SIZE as i32))
                .map_err(|e| e.to_string())
        };

        Self::free_buffer(guest, req_ptr, bytes.len() as i32);
        let written = result?;
        if written < 0 {
            Self::free_buffer(guest, out_ptr, OUT_BUFFER_SIZE as i32);
            return Err(format!("export '{export}' reported buffer too small"));
        }
        let response_bytes = Self::read_buffer(guest, out_ptr, written)?;
        Self::free_buffer(guest, out_ptr, OUT_BUFFER_SIZE as i32);
        serde_json::from_slice(&response_bytes).map_err(|e| format!("decoding response JSON: {e}"))
    }

    /// Call a bare getter export taking only a caller-supplied output
    /// buffer — the shape `plugin_schema`/`http_endpoints` use, since
    /// unlike a request handler they have no request payload to write.
    fn call_buffered_getter(guest: &Guest, export: &str) -> Result<GuestJson, String> {
        let out_ptr = Self::write_buffer(guest, &vec![0u8; OUT_BUFFER_SIZE])?;
        let result = {
            let mut store = guest.store.lock().expect("dialect B store lock poisoned");
            let func = guest
                .instance
                .get_typed_func::<(i32, i32), i32>(&mut *store, export)
                .map_err(|e| format!("missing export '{export}': {e}"))?;
            func.call(&mut *store, (out_ptr, OUT_BUFFER_SIZE as i32)).map_err(|e| e.to_string())
        };
        let written = result?;
        if written < 0 {
            Self::free_buffer(guest, out_ptr, OUT_BUFFER_SIZE as i32);
            return Err(format!("export '{export}' reported buffer too small"));
        }
        let response_bytes = Self::read_buffer(guest, out_ptr, written)?;
        Self::free_buffer(guest, out_ptr, OUT_BUFFER_SIZE as i32);
        serde_json::from_slice(&response_bytes).map_err(|e| format!("decoding response JSON: {e}"))
    }
}

#[async_trait]
impl PluginInstance for DialectBInstance {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn dialect(&self) -> GuestDialect {
        GuestDialect::B
    }

    fn supports_asyncify(&self) -> bool {
        super::module_has_export(&self.module, ASYNCIFY_STATE_EXPORT)
    }

    async fn call_start(&self, config: GuestJson) -> Result<i32, HostError> {
        let guest = Arc::clone(&self.guest);
        let config_bytes = serde_json::to_vec(&config).map_err(|e| HostError::MarshalError {
            plugin_id: self.plugin_id.clone(),
            reason: e.to_string(),
        })?;
        run_with_watchdog(&self.plugin_id, self.call_timeout, move || {
            let ptr = Self::write_buffer(&guest, &config_bytes)?;
            let result = {
                let mut store = guest.store.lock().expect("dialect B store lock poisoned");
                let start = guest
                    .instance
                    .get_typed_func::<(i32, i32), i32>(&mut *store, "plugin_start")
                    .map_err(|e| format!("missing plugin_start export: {e}"))?;
                start.call(&mut *store, (ptr, config_bytes.len() as i32)).map_err(|e| e.to_string())
            };
            Self::free_buffer(&guest, ptr, config_bytes.len() as i32);
            result
        })
        .await
    }

    async fn call_stop(&self) -> Result<(), HostError> {
        let guest = Arc::clone(&self.guest);
        run_with_watchdog(&self.plugin_id, self.call_timeout, move || {
            let mut store = guest.store.lock().expect("dialect B store lock poisoned");
            let stop = guest
                .instance
                .get_typed_func::<(), i32>(&mut *store, "plugin_stop")
                .map_err(|e| format!("missing plugin_stop export: {e}"))?;
            stop.call(&mut *store, ()).map_err(|e| e.to_string()).map(|_code| ())
        })
        .await
    }

    async fn call_http_handler(&self, export_name: &str, request: GuestJson) -> Result<GuestJson, HostError> {
        let guest = Arc::clone(&self.guest);
        let export_name = export_name.to_string();
        run_with_watchdog(&self.plugin_id, self.call_timeout, move || Self::call_buffered_json(&guest, &export_name, &request))
            .await
    }

    async fn call_on_delta(&self, export_name: &str, delta: GuestJson) -> Result<(), HostError> {
        let guest = Arc::clone(&self.guest);
        let export_name = export_name.to_string();
        run_with_watchdog(&self.plugin_id, self.call_timeout, move || {
            let context = delta.get("context").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let path = delta.get("path").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let value = delta.get("value").cloned().unwrap_or(serde_json::Value::Null);
            let value_bytes = serde_json::to_vec(&value).map_err(|e| e.to_string())?;

            let ctx_ptr = Self::write_buffer(&guest, context.as_bytes())?;
            let path_ptr = Self::write_buffer(&guest, path.as_bytes())?;
            let value_ptr = Self::write_buffer(&guest, &value_bytes)?;

            let result = {
                let mut store = guest.store.lock().expect("dialect B store lock poisoned");
                let func = guest
                    .instance
                    .get_typed_func::<(i32, i32, i32, i32, i32, i32), ()>(&mut *store, &export_name)
                    .map_err(|e| format!("missing export '{export_name}': {e}"))?;
                func.call(
                    &mut *store,
                    (
                        ctx_ptr,
                        context.len() as i32,
                        path_ptr,
                        path.len() as i32,
                        value_ptr,
                        value_bytes.len() as i32,
                    ),
                )
                .map_err(|e| e.to_string())
            };

            Self::free_buffer(&guest, ctx_ptr, context.len() as i32);
            Self::free_buffer(&guest, path_ptr, path.len() as i32);
            Self::free_buffer(&guest, value_ptr, value_bytes.len() as i32);
            result
        })
        .await
    }

    async fn call_json_export(&self, export_name: &str, payload: GuestJson) -> Result<GuestJson, HostError> {
        if payload.is_null() {
            let guest = Arc::clone(&self.guest);
            let export_name = export_name.to_string();
            run_with_watchdog(&self.plugin_id, self.call_timeout, move || Self::call_buffered_getter(&guest, &export_name)).await
        } else {
            self.call_http_handler(export_name, payload).await
        }
    }

    fn has_export(&self, export_name: &str) -> bool {
        super::module_has_export(&self.module, export_name)
    }

    async fn call_poll(&self) -> Result<(), HostError> {
        if !self.has_export("poll") {
            return Ok(());
        }
        let guest = Arc::clone(&self.guest);
        run_with_watchdog(&self.plugin_id, self.call_timeout, move || {
            let mut store = guest.store.lock().expect("dialect B store lock poisoned");
            let poll = guest
                .instance
                .get_typed_func::<(), ()>(&mut *store, "poll")
                .map_err(|e| format!("missing poll export: {e}"))?;
            poll.call(&mut *store, ()).map_err(|e| e.to_string())
        })
        .await
    }
}
