//! Provider registries: PUT handlers, and resource/weather/radar providers.
//!
//! All four registries share the same shape — a table keyed by lookup
//! coordinates, populated once at plugin registration time rather than
//! synthesized per request — and the same unregistration behavior:
//! removing the current default promotes the next-registered provider (by
//! registration order) to default, if any remain.

use std::collections::HashMap;
use std::sync::RwLock;

/// A PUT handler is keyed by the `(context, path)` pair it was registered
/// against, populated when the owning plugin registers, not synthesized
/// from the request path at lookup time (see SPEC_FULL.md design note on
/// PUT dispatch).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PutKey {
    pub context: String,
    pub path: String,
}

#[derive(Debug, Clone)]
struct Registration {
    plugin_id: String,
}

/// Table of PUT handlers. Multiple plugins may register against the same
/// `(context, path)`; all are invoked, the way a real marine-data server's
/// PUT dispatch fans out to every registered handler.
pub struct PutHandlerTable {
    handlers: RwLock<HashMap<PutKey, Vec<Registration>>>,
}

impl PutHandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, plugin_id: &str, context: &str, path: &str) {
        let key = PutKey {
            context: context.to_string(),
            path: path.to_string(),
        };
        let mut handlers = self.handlers.write().expect("put handler table lock poisoned");
        let entry = handlers.entry(key).or_default();
        if !entry.iter().any(|r| r.plugin_id == plugin_id) {
            entry.push(Registration {
                plugin_id: plugin_id.to_string(),
            });
        }
    }

    pub fn unregister(&self, plugin_id: &str, context: &str, path: &str) {
        let key = PutKey {
            context: context.to_string(),
            path: path.to_string(),
        };
        let mut handlers = self.handlers.write().expect("put handler table lock poisoned");
        if let Some(entry) = handlers.get_mut(&key) {
            entry.retain(|r| r.plugin_id != plugin_id);
            if entry.is_empty() {
                handlers.remove(&key);
            }
        }
    }

    pub fn unregister_all_for_plugin(&self, plugin_id: &str) {
        let mut handlers = self.handlers.write().expect("put handler table lock poisoned");
        handlers.retain(|_, regs| {
            regs.retain(|r| r.plugin_id != plugin_id);
            !regs.is_empty()
        });
    }

    /// Plugin ids registered against `(context, path)`, in registration order.
    pub fn lookup(&self, context: &str, path: &str) -> Vec<String> {
        let key = PutKey {
            context: context.to_string(),
            path: path.to_string(),
        };
        let handlers = self.handlers.read().expect("put handler table lock poisoned");
        handlers
            .get(&key)
            .map(|regs| regs.iter().map(|r| r.plugin_id.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for PutHandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-winner provider slot (resource, weather, or radar). Unlike PUT
/// handlers, only one plugin's registration is the active default at a
/// time; unregistering the default promotes the next-oldest remaining
/// registration.
pub struct ProviderTable {
    /// Registration order per key, oldest first; the front is the default.
    registrations: RwLock<HashMap<String, Vec<String>>>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: &str, plugin_id: &str) {
        let mut regs = self.registrations.write().expect("provider table lock poisoned");
        let entry = regs.entry(key.to_string()).or_default();
        if !entry.iter().any(|p| p == plugin_id) {
            entry.push(plugin_id.to_string());
        }
    }

    pub fn unregister(&self, key: &str, plugin_id: &str) {
        let mut regs = self.registrations.write().expect("provider table lock poisoned");
        if let Some(entry) = regs.get_mut(key) {
            entry.retain(|p| p != plugin_id);
            if entry.is_empty() {
                regs.remove(key);
            }
        }
    }

    pub fn unregister_all_for_plugin(&self, plugin_id: &str) {
        let mut regs = self.registrations.write().expect("provider table lock poisoned");
        regs.retain(|_, entries| {
            entries.retain(|p| p != plugin_id);
            !entries.is_empty()
        });
    }

    /// The current default provider for `key`, if any remain registered.
    pub fn default_provider(&self, key: &str) -> Option<String> {
        let regs = self.registrations.read().expect("provider table lock poisoned");
        regs.get(key).and_then(|entries| entries.first().cloned())
    }

    pub fn all_providers(&self, key: &str) -> Vec<String> {
        let regs = self.registrations.read().expect("provider table lock poisoned");
        regs.get(key).cloned().unwrap_or_default()
    }
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The three provider kinds named in the spec, each holding its own table
/// because resource/weather/radar providers are keyed and registered
/// independently (a plugin may be the weather provider without being a
/// resource provider, and vice versa).
pub struct ProviderRegistries {
    pub resources: ProviderTable,
    pub weather: ProviderTable,
    pub radar: ProviderTable,
    pub put_handlers: PutHandlerTable,
}

impl ProviderRegistries {
    pub fn new() -> Self {
        Self {
            resources: ProviderTable::new(),
            weather: ProviderTable::new(),
            radar: ProviderTable::new(),
            put_handlers: PutHandlerTable::new(),
        }
    }

    /// Remove every registration made by a plugin, across all four tables.
    /// Called when a plugin is stopped, disabled, or crashes.
    pub fn unregister_all_for_plugin(&self, plugin_id: &str) {
        self.resources.unregister_all_for_plugin(plugin_id);
        self.weather.unregister_all_for_plugin(plugin_id);
        self.radar.unregister_all_for_plugin(plugin_id);
        self.put_handlers.unregister_all_for_plugin(plugin_id);
    }
}

impl Default for ProviderRegistries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_handlers_fan_out_to_all_registered_plugins() {
        let table = PutHandlerTable::new();
        table.register("plugin-a", "vessels.self", "navigation.lights");
        table.register("plugin-b", "vessels.self", "navigation.lights");

        let handlers = table.lookup("vessels.self", "navigation.lights");
        assert_eq!(handlers, vec!["plugin-a".to_string(), "plugin-b".to_string()]);
    }

    #[test]
    fn unregister_removes_only_the_named_plugin() {
        let table = PutHandlerTable::new();
        table.register("plugin-a", "vessels.self", "navigation.lights");
        table.register("plugin-b", "vessels.self", "navigation.lights");
        table.unregister("plugin-a", "vessels.self", "navigation.lights");

        assert_eq!(table.lookup("vessels.self", "navigation.lights"), vec!["plugin-b".to_string()]);
    }

    #[test]
    fn provider_unregistration_promotes_next_oldest() {
        let table = ProviderTable::new();
        table.register("gps", "plugin-a");
        table.register("gps", "plugin-b");
        assert_eq!(table.default_provider("gps"), Some("plugin-a".to_string()));

        table.unregister("gps", "plugin-a");
        assert_eq!(table.default_provider("gps"), Some("plugin-b".to_string()));
    }

    #[test]
    fn provider_default_is_none_once_all_unregister() {
        let table = ProviderTable::new();
        table.register("radar0", "plugin-a");
        table.unregister("radar0", "plugin-a");
        assert_eq!(table.default_provider("radar0"), None);
    }

    #[test]
    fn unregister_all_for_plugin_clears_every_table() {
        let registries = ProviderRegistries::new();
        registries.put_handlers.register("plugin-a", "vessels.self", "navigation.lights");
        registries.weather.register("weather", "plugin-a");
        registries.radar.register("radar0", "plugin-a");
        registries.resources.register("charts", "plugin-a");

        registries.unregister_all_for_plugin("plugin-a");

        assert!(registries.put_handlers.lookup("vessels.self", "navigation.lights").is_empty());
        assert_eq!(registries.weather.default_provider("weather"), None);
        assert_eq!(registries.radar.default_provider("radar0"), None);
        assert_eq!(registries.resources.default_provider("charts"), None);
    }
}
