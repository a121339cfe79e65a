//! Guest import ABI (§6): the capability-gated host functions published
//! to every guest under the `env` module, regardless of which of the
//! three ABI dialects the guest speaks — the import surface is shared,
//! only the export surface differs per dialect.
//!
//! Every function here performs its capability check first and returns
//! the documented sentinel on denial; none of them ever trap or propagate
//! a Rust error across the FFI boundary (invariant 2, §3).

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use regex::RegexSet;
use tracing::debug;
use tracing::warn;
use wasmtime::Caller;
use wasmtime::Extern;
use wasmtime::Linker;
use wasmtime::Memory;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::capability::CapabilityFlag;
use crate::capability::Capabilities;
use crate::delta::Delta;
use crate::delta::DeltaRouter;
use crate::providers::ProviderRegistries;
use crate::socket::DeferredOption;
use crate::socket::SocketManager;
use crate::stream::StreamManager;

/// The out-of-scope collaborators named in §1: the surrounding event
/// server, REST router, auth/session machinery, and history database.
/// The core only ever talks to them through this narrow interface —
/// mirroring the teacher's `aspen_traits::ClusterController` boundary
/// trait for the distributed-KV cluster it embeds into.
pub trait HostCollaborators: Send + Sync {
    fn handle_delta(&self, plugin_id: &str, delta: &Delta);
    fn read_path(&self, context: &str, path: &str) -> Option<serde_json::Value>;
    fn set_plugin_status(&self, plugin_id: &str, message: &str);
    fn set_plugin_error(&self, plugin_id: &str, message: &str);
}

/// A collaborators implementation that observes everything and does
/// nothing, for unit tests that only care about capability gating.
#[derive(Default)]
pub struct NullCollaborators;

impl HostCollaborators for NullCollaborators {
    fn handle_delta(&self, _plugin_id: &str, _delta: &Delta) {}
    fn read_path(&self, _context: &str, _path: &str) -> Option<serde_json::Value> {
        None
    }
    fn set_plugin_status(&self, _plugin_id: &str, _message: &str) {}
    fn set_plugin_error(&self, _plugin_id: &str, _message: &str) {}
}

/// Everything one plugin's host import functions need: its own capability
/// set and resource managers, plus the shared host-wide registries and
/// the collaborator boundary. Built once per plugin by the lifecycle
/// manager at registration and handed to every instantiation of that
/// plugin across reloads.
pub struct HostImportContext {
    pub plugin_id: String,
    pub capabilities: Capabilities,
    pub delta_router: Arc<DeltaRouter>,
    pub providers: Arc<ProviderRegistries>,
    pub sockets: Arc<SocketManager>,
    pub streams: Arc<StreamManager>,
    pub collaborators: Arc<dyn HostCollaborators>,
    /// Compiled from the manifest's `wasmCapabilities.execAllowlist` patterns
    /// (§6); `sk_exec_command` denies any command that matches none of them.
    /// Empty (matches nothing) unless the manifest declares patterns.
    pub exec_allowlist: RegexSet,
    /// Flipped to `false` the instant a capability is revoked mid-run
    /// (§8 boundary: "revocation of data_write mid-run"); checked instead
    /// of a fixed `Capabilities` snapshot wherever revocation must take
    /// effect on the next call rather than only on the next reload.
    pub data_write_enabled: AtomicBool,
}

impl HostImportContext {
    pub fn new(
        plugin_id: impl Into<String>,
        capabilities: Capabilities,
        delta_router: Arc<DeltaRouter>,
        providers: Arc<ProviderRegistries>,
        sockets: Arc<SocketManager>,
        streams: Arc<StreamManager>,
        collaborators: Arc<dyn HostCollaborators>,
        exec_allowlist_patterns: &[String],
    ) -> Self {
        let plugin_id = plugin_id.into();
        let data_write_enabled = AtomicBool::new(capabilities.data_write);
        let exec_allowlist = RegexSet::new(exec_allowlist_patterns).unwrap_or_else(|error| {
            warn!(plugin = %plugin_id, %error, "invalid execAllowlist pattern, denying all sk_exec_command calls");
            RegexSet::new(std::iter::empty::<&str>()).expect("empty regex set is always valid")
        });
        Self {
            plugin_id,
            capabilities,
            delta_router,
            providers,
            sockets,
            streams,
            collaborators,
            exec_allowlist,
            data_write_enabled,
        }
    }

    pub fn revoke_data_write(&self) {
        self.data_write_enabled.store(false, Ordering::SeqCst);
    }

    fn has(&self, flag: CapabilityFlag) -> bool {
        if flag == CapabilityFlag::DataWrite {
            return self.data_write_enabled.load(Ordering::SeqCst);
        }
        self.capabilities.has(flag)
    }

    fn deny(&self, flag: CapabilityFlag) {
        warn!(
            plugin = %self.plugin_id,
            capability = Capabilities::name(flag),
            "capability denied for FFI call"
        );
    }
}

/// Store data every dialect's `Store<PluginStoreData>` carries. Shared
/// across all three dialects since the import surface (and therefore the
/// state those imports close over) does not vary by dialect.
pub struct PluginStoreData {
    pub wasi: WasiP1Ctx,
    pub import_ctx: Arc<HostImportContext>,
}

/// Read `len` bytes at `ptr` out of the guest's exported linear memory.
/// Returns `None` on a missing memory export or an out-of-bounds range —
/// callers treat that identically to a capability denial (the documented
/// sentinel), never a trap.
fn read_guest_bytes(caller: &mut Caller<'_, PluginStoreData>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let (ptr, len) = (usize::try_from(ptr).ok()?, usize::try_from(len).ok()?);
    let data = memory.data(caller);
    let end = ptr.checked_add(len)?;
    data.get(ptr..end).map(|slice| slice.to_vec())
}

fn read_guest_string(caller: &mut Caller<'_, PluginStoreData>, ptr: i32, len: i32) -> Option<String> {
    read_guest_bytes(caller, ptr, len).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Write `data` into the guest buffer `[ptr, ptr+max)`, truncating to
/// `max` and returning the number of bytes actually written, or `-1` if
/// the target range is out of bounds.
fn write_guest_bytes(caller: &mut Caller<'_, PluginStoreData>, ptr: i32, max: i32, data: &[u8]) -> i32 {
    let Some(memory) = guest_memory(caller) else {
        return -1;
    };
    let (Ok(ptr), Ok(max)) = (usize::try_from(ptr), usize::try_from(max)) else {
        return -1;
    };
    let to_write = data.len().min(max);
    let Some(end) = ptr.checked_add(to_write) else {
        return -1;
    };
    let mem_data = memory.data_mut(caller);
    let Some(dest) = mem_data.get_mut(ptr..end) else {
        return -1;
    };
    dest.copy_from_slice(&data[..to_write]);
    i32::try_from(to_write).unwrap_or(-1)
}

fn guest_memory(caller: &mut Caller<'_, PluginStoreData>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Some(memory),
        _ => None,
    }
}

/// Register the full `env` import surface on `linker`. Called once per
/// dialect adapter during instantiation (the closures are generic over
/// `PluginStoreData`, so all three dialects share this wiring verbatim).
pub fn add_host_imports(linker: &mut Linker<PluginStoreData>) -> anyhow::Result<()> {
    linker.func_wrap("env", "sk_debug", |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32| {
        let plugin_id = caller.data().import_ctx.plugin_id.clone();
        if let Some(message) = read_guest_string(&mut caller, ptr, len) {
            debug!(plugin = %plugin_id, guest_message = %message, "guest debug log");
        }
    })?;

    linker.func_wrap("env", "sk_set_status", |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32| {
        let ctx = Arc::clone(&caller.data().import_ctx);
        if let Some(message) = read_guest_string(&mut caller, ptr, len) {
            ctx.collaborators.set_plugin_status(&ctx.plugin_id, &message);
        }
    })?;

    linker.func_wrap("env", "sk_set_error", |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32| {
        let ctx = Arc::clone(&caller.data().import_ctx);
        if let Some(message) = read_guest_string(&mut caller, ptr, len) {
            ctx.collaborators.set_plugin_error(&ctx.plugin_id, &message);
        }
    })?;

    linker.func_wrap(
        "env",
        "sk_handle_message",
        |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::DataWrite) {
                ctx.deny(CapabilityFlag::DataWrite);
                return -1;
            }
            let Some(json) = read_guest_string(&mut caller, ptr, len) else {
                return -1;
            };
            let Ok(delta) = serde_json::from_str::<Delta>(&json) else {
                return -1;
            };
            ctx.collaborators.handle_delta(&ctx.plugin_id, &delta);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_get_self_path",
        |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32, out: i32, max: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::DataRead) {
                ctx.deny(CapabilityFlag::DataRead);
                return -1;
            }
            let Some(path) = read_guest_string(&mut caller, ptr, len) else {
                return -1;
            };
            let Some(value) = ctx.collaborators.read_path("vessels.self", &path) else {
                return -1;
            };
            let bytes = serde_json::to_vec(&value).unwrap_or_default();
            write_guest_bytes(&mut caller, out, max, &bytes)
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_get_path",
        |mut caller: Caller<'_, PluginStoreData>,
         ctx_ptr: i32,
         ctx_len: i32,
         path_ptr: i32,
         path_len: i32,
         out: i32,
         max: i32|
         -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::DataRead) {
                ctx.deny(CapabilityFlag::DataRead);
                return -1;
            }
            let (Some(context), Some(path)) = (
                read_guest_string(&mut caller, ctx_ptr, ctx_len),
                read_guest_string(&mut caller, path_ptr, path_len),
            ) else {
                return -1;
            };
            let Some(value) = ctx.collaborators.read_path(&context, &path) else {
                return -1;
            };
            let bytes = serde_json::to_vec(&value).unwrap_or_default();
            write_guest_bytes(&mut caller, out, max, &bytes)
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_has_capability",
        |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32| -> i32 {
            let Some(name) = read_guest_string(&mut caller, ptr, len) else {
                return 0;
            };
            let ctx = &caller.data().import_ctx;
            let has = match name.as_str() {
                "dataRead" | "data_read" => ctx.has(CapabilityFlag::DataRead),
                "dataWrite" | "data_write" => ctx.has(CapabilityFlag::DataWrite),
                "network" => ctx.has(CapabilityFlag::Network),
                "putHandlers" | "put_handlers" => ctx.has(CapabilityFlag::PutHandlers),
                "resourceProvider" | "resource_provider" => ctx.has(CapabilityFlag::ResourceProvider),
                "weatherProvider" | "weather_provider" => ctx.has(CapabilityFlag::WeatherProvider),
                "radarProvider" | "radar_provider" => ctx.has(CapabilityFlag::RadarProvider),
                "rawSockets" | "raw_sockets" => ctx.has(CapabilityFlag::RawSockets),
                "httpEndpoints" | "http_endpoints" => ctx.has(CapabilityFlag::HttpEndpoints),
                "staticFiles" | "static_files" => ctx.has(CapabilityFlag::StaticFiles),
                _ => false,
            };
            has as i32
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_register_put_handler",
        |mut caller: Caller<'_, PluginStoreData>, ctx_ptr: i32, ctx_len: i32, path_ptr: i32, path_len: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::PutHandlers) {
                ctx.deny(CapabilityFlag::PutHandlers);
                return -1;
            }
            let (Some(context), Some(path)) = (
                read_guest_string(&mut caller, ctx_ptr, ctx_len),
                read_guest_string(&mut caller, path_ptr, path_len),
            ) else {
                return -1;
            };
            ctx.providers.put_handlers.register(&ctx.plugin_id, &context, &path);
            let delta = Delta {
                context: context.clone(),
                path: path.clone(),
                value: serde_json::json!({ "supportsPut": true }),
                timestamp_ms: 0,
            };
            ctx.collaborators.handle_delta(&ctx.plugin_id, &delta);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_register_resource_provider",
        |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::ResourceProvider) {
                ctx.deny(CapabilityFlag::ResourceProvider);
                return -1;
            }
            let Some(resource_type) = read_guest_string(&mut caller, ptr, len) else {
                return -1;
            };
            ctx.providers.resources.register(&resource_type, &ctx.plugin_id);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_register_weather_provider",
        |caller: Caller<'_, PluginStoreData>| -> i32 {
            let ctx = &caller.data().import_ctx;
            if !ctx.has(CapabilityFlag::WeatherProvider) {
                ctx.deny(CapabilityFlag::WeatherProvider);
                return -1;
            }
            ctx.providers.weather.register("default", &ctx.plugin_id);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_register_radar_provider",
        |mut caller: Caller<'_, PluginStoreData>, ptr: i32, len: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::RadarProvider) {
                ctx.deny(CapabilityFlag::RadarProvider);
                return -1;
            }
            let Some(name) = read_guest_string(&mut caller, ptr, len) else {
                return -1;
            };
            ctx.providers.radar.register(&name, &ctx.plugin_id);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_radar_emit_spokes",
        |mut caller: Caller<'_, PluginStoreData>,
         radar_id_ptr: i32,
         radar_id_len: i32,
         bytes_ptr: i32,
         bytes_len: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::RadarProvider) {
                ctx.deny(CapabilityFlag::RadarProvider);
                return -1;
            }
            let (Some(radar_id), Some(bytes)) = (
                read_guest_string(&mut caller, radar_id_ptr, radar_id_len),
                read_guest_bytes(&mut caller, bytes_ptr, bytes_len),
            ) else {
                return -1;
            };
            let stream_id = format!("radars/{radar_id}");
            let streams = Arc::clone(&ctx.streams);
            tokio::runtime::Handle::current().block_on(streams.emit(&stream_id, bytes));
            0
        },
    )?;

    linker.func_wrap("env", "sk_udp_create", |caller: Caller<'_, PluginStoreData>, _kind: i32| -> i32 {
        let ctx = &caller.data().import_ctx;
        if !ctx.has(CapabilityFlag::RawSockets) {
            ctx.deny(CapabilityFlag::RawSockets);
            return -1;
        }
        let sockets = Arc::clone(&ctx.sockets);
        let handle = tokio::runtime::Handle::current().block_on(sockets.allocate_handle());
        i32::try_from(handle).unwrap_or(-1)
    })?;

    linker.func_wrap(
        "env",
        "sk_udp_bind",
        |caller: Caller<'_, PluginStoreData>, sock: i32, port: i32| -> i32 {
            let ctx = &caller.data().import_ctx;
            if !ctx.has(CapabilityFlag::RawSockets) {
                ctx.deny(CapabilityFlag::RawSockets);
                return -1;
            }
            let (Ok(handle), Ok(port)) = (u64::try_from(sock), u16::try_from(port)) else {
                return -1;
            };
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let sockets = Arc::clone(&ctx.sockets);
            match tokio::runtime::Handle::current().block_on(sockets.bind(handle, addr)) {
                Ok(()) => 0,
                Err(e) => {
                    warn!(plugin = %ctx.plugin_id, error = %e, "udp bind failed");
                    -1
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_udp_join_multicast",
        |mut caller: Caller<'_, PluginStoreData>,
         sock: i32,
         addr_ptr: i32,
         addr_len: i32,
         iface_ptr: i32,
         iface_len: i32| -> i32 {
            udp_multicast_option(&mut caller, sock, addr_ptr, addr_len, iface_ptr, iface_len, false)
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_udp_leave_multicast",
        |mut caller: Caller<'_, PluginStoreData>,
         sock: i32,
         addr_ptr: i32,
         addr_len: i32,
         iface_ptr: i32,
         iface_len: i32| -> i32 {
            udp_multicast_option(&mut caller, sock, addr_ptr, addr_len, iface_ptr, iface_len, true)
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_udp_set_multicast_ttl",
        |caller: Caller<'_, PluginStoreData>, sock: i32, ttl: i32| -> i32 {
            udp_request_option(&caller, sock, DeferredOption::SetTtl(ttl.max(0) as u32))
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_udp_set_multicast_loopback",
        |caller: Caller<'_, PluginStoreData>, sock: i32, enabled: i32| -> i32 {
            udp_request_option(&caller, sock, DeferredOption::SetMulticastLoop(enabled != 0))
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_udp_set_broadcast",
        |caller: Caller<'_, PluginStoreData>, sock: i32, enabled: i32| -> i32 {
            udp_request_option(&caller, sock, DeferredOption::SetBroadcast(enabled != 0))
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_udp_send",
        |mut caller: Caller<'_, PluginStoreData>,
         sock: i32,
         addr_ptr: i32,
         addr_len: i32,
         port: i32,
         data_ptr: i32,
         data_len: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::RawSockets) {
                ctx.deny(CapabilityFlag::RawSockets);
                return -1;
            }
            let (Ok(handle), Ok(port)) = (u64::try_from(sock), u16::try_from(port)) else {
                return -1;
            };
            let (Some(addr_str), Some(data)) = (
                read_guest_string(&mut caller, addr_ptr, addr_len),
                read_guest_bytes(&mut caller, data_ptr, data_len),
            ) else {
                return -1;
            };
            let Ok(ip) = addr_str.parse::<std::net::IpAddr>() else {
                return -1;
            };
            let sockets = Arc::clone(&ctx.sockets);
            match tokio::runtime::Handle::current().block_on(sockets.send_to(handle, &data, SocketAddr::new(ip, port))) {
                Ok(_) => 0,
                Err(_) => -1,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "sk_udp_recv",
        |mut caller: Caller<'_, PluginStoreData>, sock: i32, buf: i32, buf_max: i32, addr_out: i32, port_out: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::RawSockets) {
                ctx.deny(CapabilityFlag::RawSockets);
                return -1;
            }
            let Ok(handle) = u64::try_from(sock) else {
                return -1;
            };
            let sockets = Arc::clone(&ctx.sockets);
            let Some(datagram) = tokio::runtime::Handle::current().block_on(sockets.try_recv(handle)) else {
                return 0;
            };
            let addr_bytes = datagram.from.ip().to_string().into_bytes();
            write_guest_bytes(&mut caller, addr_out, addr_bytes.len() as i32, &addr_bytes);
            let port_bytes = (datagram.from.port() as u32).to_le_bytes();
            write_guest_bytes(&mut caller, port_out, port_bytes.len() as i32, &port_bytes);
            write_guest_bytes(&mut caller, buf, buf_max, &datagram.data)
        },
    )?;

    linker.func_wrap("env", "sk_udp_pending", |caller: Caller<'_, PluginStoreData>, sock: i32| -> i32 {
        let ctx = Arc::clone(&caller.data().import_ctx);
        if !ctx.has(CapabilityFlag::RawSockets) {
            ctx.deny(CapabilityFlag::RawSockets);
            return -1;
        }
        let Ok(handle) = u64::try_from(sock) else {
            return -1;
        };
        let sockets = Arc::clone(&ctx.sockets);
        match tokio::runtime::Handle::current().block_on(sockets.pending(handle)) {
            Some(depth) => depth as i32,
            None => -1,
        }
    })?;

    linker.func_wrap("env", "sk_udp_close", |caller: Caller<'_, PluginStoreData>, sock: i32| {
        let ctx = Arc::clone(&caller.data().import_ctx);
        if let Ok(handle) = u64::try_from(sock) {
            let sockets = Arc::clone(&ctx.sockets);
            tokio::runtime::Handle::current().block_on(sockets.close(handle));
        }
    })?;

    linker.func_wrap(
        "env",
        "sk_exec_command",
        |mut caller: Caller<'_, PluginStoreData>, cmd_ptr: i32, cmd_len: i32, out: i32, out_max: i32| -> i32 {
            let ctx = Arc::clone(&caller.data().import_ctx);
            if !ctx.has(CapabilityFlag::Network) {
                ctx.deny(CapabilityFlag::Network);
                return 0;
            }
            let Some(command) = read_guest_string(&mut caller, cmd_ptr, cmd_len) else {
                return 0;
            };
            if !ctx.exec_allowlist.is_match(&command) {
                warn!(plugin = %ctx.plugin_id, %command, "sk_exec_command rejected: not on allow-list");
                return 0;
            }
            let output = std::process::Command::new("sh").arg("-c").arg(&command).output();
            match output {
                Ok(result) if result.status.success() => write_guest_bytes(&mut caller, out, out_max, &result.stdout).max(0),
                _ => 0,
            }
        },
    )?;

    Ok(())
}

fn udp_multicast_option(
    caller: &mut Caller<'_, PluginStoreData>,
    sock: i32,
    addr_ptr: i32,
    addr_len: i32,
    iface_ptr: i32,
    iface_len: i32,
    leave: bool,
) -> i32 {
    let ctx = Arc::clone(&caller.data().import_ctx);
    if !ctx.has(CapabilityFlag::RawSockets) {
        ctx.deny(CapabilityFlag::RawSockets);
        return -1;
    }
    let (Some(addr_str), Some(iface_str)) = (
        read_guest_string(caller, addr_ptr, addr_len),
        read_guest_string(caller, iface_ptr, iface_len),
    ) else {
        return -1;
    };
    let (Ok(multiaddr), Ok(interface)) = (addr_str.parse::<Ipv4Addr>(), iface_str.parse::<Ipv4Addr>()) else {
        return -1;
    };
    let option = if leave {
        DeferredOption::LeaveMulticastV4 { multiaddr, interface }
    } else {
        DeferredOption::JoinMulticastV4 { multiaddr, interface }
    };
    let Ok(handle) = u64::try_from(sock) else {
        return -1;
    };
    let sockets = Arc::clone(&ctx.sockets);
    match tokio::runtime::Handle::current().block_on(sockets.request_option(handle, option)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn udp_request_option(caller: &Caller<'_, PluginStoreData>, sock: i32, option: DeferredOption) -> i32 {
    let ctx = &caller.data().import_ctx;
    if !ctx.has(CapabilityFlag::RawSockets) {
        ctx.deny(CapabilityFlag::RawSockets);
        return -1;
    }
    let Ok(handle) = u64::try_from(sock) else {
        return -1;
    };
    let sockets = Arc::clone(&ctx.sockets);
    match tokio::runtime::Handle::current().block_on(sockets.request_option(handle, option)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StorageMode;

    fn test_context(capabilities: Capabilities) -> HostImportContext {
        test_context_with_allowlist(capabilities, &[])
    }

    fn test_context_with_allowlist(capabilities: Capabilities, exec_allowlist_patterns: &[String]) -> HostImportContext {
        HostImportContext::new(
            "test-plugin",
            capabilities,
            Arc::new(DeltaRouter::new()),
            Arc::new(ProviderRegistries::new()),
            Arc::new(SocketManager::new("test-plugin")),
            Arc::new(StreamManager::new("test-plugin")),
            Arc::new(NullCollaborators),
            exec_allowlist_patterns,
        )
    }

    #[test]
    fn denied_capability_reports_without_panicking() {
        let ctx = test_context(Capabilities::default());
        assert!(!ctx.has(CapabilityFlag::DataWrite));
        ctx.deny(CapabilityFlag::DataWrite); // must not panic
    }

    #[test]
    fn revoking_data_write_takes_effect_immediately() {
        let caps = Capabilities {
            data_write: true,
            storage: StorageMode::None,
            ..Default::default()
        };
        let ctx = test_context(caps);
        assert!(ctx.has(CapabilityFlag::DataWrite));
        ctx.revoke_data_write();
        assert!(!ctx.has(CapabilityFlag::DataWrite));
    }

    #[test]
    fn other_capabilities_unaffected_by_data_write_revocation() {
        let caps = Capabilities {
            data_write: true,
            data_read: true,
            ..Default::default()
        };
        let ctx = test_context(caps);
        ctx.revoke_data_write();
        assert!(ctx.has(CapabilityFlag::DataRead));
    }

    #[test]
    fn exec_allowlist_matches_only_configured_patterns() {
        let patterns = vec!["^journalctl ".to_string(), "^ls /data$".to_string()];
        let ctx = test_context_with_allowlist(Capabilities::default(), &patterns);
        assert!(ctx.exec_allowlist.is_match("journalctl -u marine-server"));
        assert!(ctx.exec_allowlist.is_match("ls /data"));
        assert!(!ctx.exec_allowlist.is_match("rm -rf /"));
    }

    #[test]
    fn empty_exec_allowlist_matches_nothing() {
        let ctx = test_context(Capabilities::default());
        assert!(!ctx.exec_allowlist.is_match("echo hi"));
    }

    #[test]
    fn invalid_exec_allowlist_pattern_falls_back_to_denying_everything() {
        let patterns = vec!["(".to_string()];
        let ctx = test_context_with_allowlist(Capabilities::default(), &patterns);
        assert!(!ctx.exec_allowlist.is_match("anything"));
    }
}
