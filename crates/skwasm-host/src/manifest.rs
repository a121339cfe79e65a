//! Package metadata and the per-plugin persisted configuration file.
//!
//! A WASM plugin is distinguished from a native one solely by the presence
//! of `wasmManifest` in its package metadata (§4.I). Everything else here
//! is bookkeeping: deriving a stable, filesystem-safe `plugin_id` from the
//! package name, and the `<plugin_id>.json` sidecar that survives reloads.

use serde::Deserialize;
use serde::Serialize;

use crate::capability::Capabilities;

/// Package metadata as read from a plugin's manifest file (e.g.
/// `package.json`-equivalent). Only the fields this host cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Sole marker distinguishing a WASM plugin from a native one.
    #[serde(rename = "wasmManifest")]
    pub wasm_manifest: String,
    #[serde(rename = "wasmCapabilities", default)]
    pub wasm_capabilities: Option<serde_json::Value>,
}

/// Derive the stable `plugin_id` from a package name.
///
/// Scoped names (`@org/name`) are sanitized to `org-name`; unscoped names
/// are used verbatim. Two distinct package names never collide: the
/// mapping from `(scope, name)` to `plugin_id` is injective because `/` is
/// replaced with a separator that cannot occur in either component (npm
/// package name rules disallow `-` at a position that would make
/// `@a/b-c` collide with `@a-b/c`... we additionally escape any literal
/// `-` that was already present in the scope or name component, so the
/// separator itself is unambiguous).
pub fn derive_plugin_id(package_name: &str) -> String {
    match package_name.strip_prefix('@') {
        Some(rest) => match rest.split_once('/') {
            Some((scope, name)) => format!("{}--{}", escape_component(scope), escape_component(name)),
            None => escape_component(rest),
        },
        None => package_name.to_string(),
    }
}

fn escape_component(component: &str) -> String {
    component.replace('-', "__")
}

/// The `<plugin_id>.json` sidecar: host-side, outside the VFS.
///
/// Shared by value between disk and the in-memory plugin record — writes
/// go to disk before or during the state transition they describe (§5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginConfigFile {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "enableDebug")]
    pub enable_debug: bool,
    #[serde(default = "default_configuration")]
    pub configuration: serde_json::Value,
}

fn default_configuration() -> serde_json::Value {
    serde_json::json!({})
}

impl Default for PluginConfigFile {
    fn default() -> Self {
        Self {
            enabled: false,
            enable_debug: false,
            configuration: default_configuration(),
        }
    }
}

impl PluginConfigFile {
    /// Build the JSON object passed to the guest's `start` export: the
    /// persisted `configuration`, merged with the `enableDebug` flag (§4.I
    /// "Start").
    pub fn merged_start_payload(&self) -> serde_json::Value {
        let mut merged = match &self.configuration {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        merged.insert("enableDebug".to_string(), serde_json::Value::Bool(self.enable_debug));
        serde_json::Value::Object(merged)
    }

    pub fn load_or_default(path: &std::path::Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).unwrap_or_default();
        std::fs::write(path, json)
    }
}

/// Parsed registration inputs for one plugin, ready to hand to the
/// lifecycle manager.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub plugin_id: String,
    pub display_name: String,
    pub version: String,
    pub wasm_path: std::path::PathBuf,
    pub package_dir: std::path::PathBuf,
    pub capabilities: Capabilities,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_name_used_verbatim() {
        assert_eq!(derive_plugin_id("anchor-alarm"), "anchor-alarm");
    }

    #[test]
    fn scoped_name_sanitized() {
        assert_eq!(derive_plugin_id("@signalk/charts-plugin"), "signalk--charts-plugin");
    }

    #[test]
    fn distinct_names_never_collide() {
        let a = derive_plugin_id("@a/b-c");
        let b = derive_plugin_id("@a-b/c");
        assert_ne!(a, b, "scoped package names with shuffled hyphen placement must not collide");
    }

    #[test]
    fn many_distinct_names_yield_distinct_ids() {
        let names = [
            "anchor-alarm",
            "@signalk/charts-plugin",
            "@signalk/charts-plugin-2",
            "@foo/bar",
            "@foobar",
            "foobar",
        ];
        let mut ids: Vec<String> = names.iter().map(|n| derive_plugin_id(n)).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before, "plugin id derivation must be collision-free over this sample");
    }

    #[test]
    fn merged_start_payload_includes_enable_debug() {
        let cfg = PluginConfigFile {
            enabled: true,
            enable_debug: false,
            configuration: serde_json::json!({ "updateRate": 1000 }),
        };
        let payload = cfg.merged_start_payload();
        assert_eq!(payload["updateRate"], 1000);
        assert_eq!(payload["enableDebug"], false);
    }
}
