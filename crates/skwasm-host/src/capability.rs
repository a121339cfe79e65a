//! Capability model.
//!
//! A fixed, extensible record of booleans plus one enum-valued slot, parsed
//! from a `wasmCapabilities` object in package metadata at registration
//! time. Unknown keys are ignored; missing keys default to the most
//! restrictive value (`false` / `StorageMode::None`).
//!
//! Every host import function performs an O(1) capability check as its
//! first action (see `runtime::imports`) and returns a domain-appropriate
//! failure sentinel on denial — it never aborts the guest call.

use serde::Deserialize;
use serde::Serialize;

/// How a plugin's `storage` capability is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    None,
    VfsOnly,
}

/// A plugin's capability set.
///
/// All fields default to the most restrictive value. Deserializing from an
/// untrusted `wasmCapabilities` object never fails on unknown keys —
/// `#[serde(default)]` on every field means a partial or garbled object
/// degrades to "deny everything not explicitly granted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub data_read: bool,
    pub data_write: bool,
    pub network: bool,
    pub put_handlers: bool,
    pub resource_provider: bool,
    pub weather_provider: bool,
    pub radar_provider: bool,
    pub raw_sockets: bool,
    pub http_endpoints: bool,
    pub static_files: bool,
    pub storage: StorageMode,
}

impl Capabilities {
    /// Parse a `wasmCapabilities` JSON object. A missing or non-object
    /// value resolves to the all-denied default rather than an error —
    /// capability parsing is never allowed to block registration.
    pub fn from_manifest_value(value: Option<&serde_json::Value>) -> Self {
        match value {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_default(),
            None => Self::default(),
        }
    }

    /// Parse the `execAllowlist` array out of the same `wasmCapabilities`
    /// object (kept separate from the `Capabilities` struct proper since
    /// it's a list of regex patterns, not a `Copy` flag). Missing or
    /// malformed input resolves to an empty allow-list, i.e. `sk_exec_command`
    /// denies every command (§6).
    pub fn exec_allowlist_patterns(value: Option<&serde_json::Value>) -> Vec<String> {
        value
            .and_then(|v| v.get("execAllowlist"))
            .and_then(|v| v.as_array())
            .map(|patterns| {
                patterns
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name of the capability gating a given FFI import, for logging.
    pub const fn name(flag: CapabilityFlag) -> &'static str {
        match flag {
            CapabilityFlag::DataRead => "data_read",
            CapabilityFlag::DataWrite => "data_write",
            CapabilityFlag::Network => "network",
            CapabilityFlag::PutHandlers => "put_handlers",
            CapabilityFlag::ResourceProvider => "resource_provider",
            CapabilityFlag::WeatherProvider => "weather_provider",
            CapabilityFlag::RadarProvider => "radar_provider",
            CapabilityFlag::RawSockets => "raw_sockets",
            CapabilityFlag::HttpEndpoints => "http_endpoints",
            CapabilityFlag::StaticFiles => "static_files",
        }
    }

    pub fn has(&self, flag: CapabilityFlag) -> bool {
        match flag {
            CapabilityFlag::DataRead => self.data_read,
            CapabilityFlag::DataWrite => self.data_write,
            CapabilityFlag::Network => self.network,
            CapabilityFlag::PutHandlers => self.put_handlers,
            CapabilityFlag::ResourceProvider => self.resource_provider,
            CapabilityFlag::WeatherProvider => self.weather_provider,
            CapabilityFlag::RadarProvider => self.radar_provider,
            CapabilityFlag::RawSockets => self.raw_sockets,
            CapabilityFlag::HttpEndpoints => self.http_endpoints,
            CapabilityFlag::StaticFiles => self.static_files,
        }
    }
}

/// Enumerates the capability-gated FFI surface so call sites check by
/// variant instead of by ad hoc string, while `Capabilities::name` still
/// produces the string used in logs and denial messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityFlag {
    DataRead,
    DataWrite,
    Network,
    PutHandlers,
    ResourceProvider,
    WeatherProvider,
    RadarProvider,
    RawSockets,
    HttpEndpoints,
    StaticFiles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_object_denies_everything() {
        let caps = Capabilities::from_manifest_value(None);
        assert!(!caps.data_read);
        assert!(!caps.raw_sockets);
        assert_eq!(caps.storage, StorageMode::None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let value = serde_json::json!({
            "dataRead": true,
            "someFutureFlagNotYetDefined": true,
        });
        let caps = Capabilities::from_manifest_value(Some(&value));
        assert!(caps.data_read);
        assert!(!caps.network);
    }

    #[test]
    fn partial_object_defaults_missing_to_false() {
        let value = serde_json::json!({ "rawSockets": true });
        let caps = Capabilities::from_manifest_value(Some(&value));
        assert!(caps.raw_sockets);
        assert!(!caps.data_write);
    }

    #[test]
    fn garbled_value_denies_everything_instead_of_erroring() {
        let value = serde_json::json!("not-an-object");
        let caps = Capabilities::from_manifest_value(Some(&value));
        assert_eq!(caps, Capabilities::default());
    }

    #[test]
    fn storage_mode_parses_vfs_only() {
        let value = serde_json::json!({ "storage": "vfs-only" });
        let caps = Capabilities::from_manifest_value(Some(&value));
        assert_eq!(caps.storage, StorageMode::VfsOnly);
    }
}
