//! Delta subscription router.
//!
//! Plugins subscribe to dot-delimited context/path globs (e.g.
//! `vessels.self.navigation.*`) and receive matching deltas as they are
//! published. Unlike the NATS-style matching this is adapted from, only a
//! single-segment `*` wildcard is supported — there is no trailing
//! multi-segment operator. The root context `vessels.self` is canonicalized
//! before every comparison, so a plugin may subscribe to either the literal
//! form or the canonical form and still match.
//!
//! During a reload, matching deltas are held in a bounded per-plugin
//! replay buffer (capacity 1000, drop-oldest) rather than dropped; once
//! the reloaded instance is ready the buffer is drained, in order, ahead
//! of any delta accepted after the drain (§5 ordering guarantee,
//! property 3 in §8).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

const REPLAY_BUFFER_CAPACITY: usize = 1000;

/// One delta update, as published onto the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub context: String,
    pub path: String,
    #[serde(default)]
    pub value: serde_json::Value,
    pub timestamp_ms: u64,
}

impl Delta {
    fn full_topic(&self) -> String {
        format!("{}.{}", canonicalize_context(&self.context), self.path)
    }
}

/// Canonicalizes the vessel's own root context. SignalK data models refer
/// to the local vessel either by its literal UUID context or by the alias
/// `vessels.self`; subscriptions and published deltas are normalized to
/// the same canonical spelling before comparison.
fn canonicalize_context(context: &str) -> String {
    if context == "vessels.self" || context == "self" {
        "vessels.self".to_string()
    } else {
        context.to_string()
    }
}

/// A single subscription pattern, dot-segmented, `*` matching exactly one
/// segment. No segment may itself contain `*` mixed with other characters.
fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments = canonicalize_context(pattern);
    let pattern_segments: Vec<&str> = pattern_segments.split('.').collect();
    let topic_segments: Vec<&str> = topic.split('.').collect();

    if pattern_segments.len() != topic_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(topic_segments.iter())
        .all(|(p, t)| *p == "*" || p == t)
}

struct PluginSubscriptions {
    patterns: Vec<String>,
    /// Set for the duration of a hot reload (`DeltaRouter::begin_reload`
    /// .. `end_reload`); while set, matching deltas are buffered instead
    /// of marked delivered.
    reloading: bool,
    /// Deltas buffered while `reloading` was set, replayed in order once
    /// the reload completes.
    replay: VecDeque<Delta>,
}

impl PluginSubscriptions {
    fn new() -> Self {
        Self {
            patterns: Vec::new(),
            reloading: false,
            replay: VecDeque::new(),
        }
    }

    fn push_replay(&mut self, delta: Delta) {
        if self.replay.len() >= REPLAY_BUFFER_CAPACITY {
            self.replay.pop_front();
        }
        self.replay.push_back(delta);
    }
}

/// Routes published deltas to subscribed plugins by glob pattern.
pub struct DeltaRouter {
    subscriptions: RwLock<HashMap<String, PluginSubscriptions>>,
}

impl DeltaRouter {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, plugin_id: &str, pattern: &str) {
        let mut subs = self.subscriptions.write().expect("delta router lock poisoned");
        let entry = subs.entry(plugin_id.to_string()).or_insert_with(PluginSubscriptions::new);
        if !entry.patterns.iter().any(|p| p == pattern) {
            entry.patterns.push(pattern.to_string());
        }
    }

    pub fn unsubscribe(&self, plugin_id: &str, pattern: &str) {
        let mut subs = self.subscriptions.write().expect("delta router lock poisoned");
        if let Some(entry) = subs.get_mut(plugin_id) {
            entry.patterns.retain(|p| p != pattern);
        }
    }

    pub fn unsubscribe_all(&self, plugin_id: &str) {
        let mut subs = self.subscriptions.write().expect("delta router lock poisoned");
        subs.remove(plugin_id);
    }

    /// Publish a delta. Returns the ids of plugins it matched and should
    /// be delivered to live; a plugin mid-reload (see `begin_reload`) has
    /// a matching delta buffered for replay instead of returned here.
    pub fn publish(&self, delta: Delta) -> Vec<String> {
        let topic = delta.full_topic();
        let mut subs = self.subscriptions.write().expect("delta router lock poisoned");
        let mut delivered = Vec::new();
        for (plugin_id, entry) in subs.iter_mut() {
            if !entry.patterns.iter().any(|pattern| pattern_matches(pattern, &topic)) {
                continue;
            }
            if entry.reloading {
                entry.push_replay(delta.clone());
            } else {
                delivered.push(plugin_id.clone());
            }
        }
        delivered
    }

    /// Mark a plugin as mid-reload: matching deltas accepted from now on
    /// are buffered rather than delivered live, until `end_reload` drains
    /// them. Idempotent.
    pub fn begin_reload(&self, plugin_id: &str) {
        let mut subs = self.subscriptions.write().expect("delta router lock poisoned");
        let entry = subs.entry(plugin_id.to_string()).or_insert_with(PluginSubscriptions::new);
        entry.reloading = true;
    }

    /// End a plugin's reload window and drain its buffered deltas, oldest
    /// first. Clearing the flag and draining happen under the same lock
    /// so no delta accepted after this call can be placed ahead of the
    /// drained buffer (§5 ordering guarantee).
    pub fn end_reload(&self, plugin_id: &str) -> Vec<Delta> {
        let mut subs = self.subscriptions.write().expect("delta router lock poisoned");
        match subs.get_mut(plugin_id) {
            Some(entry) => {
                entry.reloading = false;
                entry.replay.drain(..).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn subscription_count(&self, plugin_id: &str) -> usize {
        let subs = self.subscriptions.read().expect("delta router lock poisoned");
        subs.get(plugin_id).map(|e| e.patterns.len()).unwrap_or(0)
    }
}

impl Default for DeltaRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(context: &str, path: &str) -> Delta {
        Delta {
            context: context.to_string(),
            path: path.to_string(),
            value: serde_json::json!(1.0),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn exact_match() {
        assert!(pattern_matches("vessels.self.navigation.speed", "vessels.self.navigation.speed"));
    }

    #[test]
    fn exact_mismatch() {
        assert!(!pattern_matches("vessels.self.navigation.speed", "vessels.self.navigation.heading"));
    }

    #[test]
    fn single_wildcard_matches_one_segment() {
        assert!(pattern_matches("vessels.self.navigation.*", "vessels.self.navigation.speed"));
    }

    #[test]
    fn single_wildcard_rejects_too_few_or_too_many_segments() {
        assert!(!pattern_matches("vessels.self.navigation.*", "vessels.self.navigation"));
        assert!(!pattern_matches(
            "vessels.self.navigation.*",
            "vessels.self.navigation.speed.extra"
        ));
    }

    #[test]
    fn no_trailing_multi_segment_wildcard_support() {
        // Unlike NATS-style routing, a lone trailing segment is not treated
        // as "zero or more" — it only ever matches exactly one segment.
        assert!(!pattern_matches("vessels.self.navigation.*", "vessels.self.navigation.speed.sog"));
    }

    #[test]
    fn self_alias_canonicalizes_to_vessels_self() {
        assert!(pattern_matches("self.navigation.speed", "vessels.self.navigation.speed"));
    }

    #[test]
    fn publish_delivers_to_matching_subscriber_only() {
        let router = DeltaRouter::new();
        router.subscribe("plugin-a", "vessels.self.navigation.*");
        router.subscribe("plugin-b", "vessels.self.environment.*");

        let delivered = router.publish(delta("vessels.self", "navigation.speed"));
        assert_eq!(delivered, vec!["plugin-a".to_string()]);
    }

    #[test]
    fn reloading_plugin_buffers_matching_deltas_with_drop_oldest() {
        let router = DeltaRouter::new();
        router.subscribe("plugin-a", "vessels.self.navigation.*");
        router.begin_reload("plugin-a");

        for i in 0..(REPLAY_BUFFER_CAPACITY + 10) {
            router.publish(delta("vessels.self", &format!("navigation.counter{i}")));
        }

        let replayed = router.end_reload("plugin-a");
        assert_eq!(replayed.len(), REPLAY_BUFFER_CAPACITY);
        assert_eq!(replayed.first().unwrap().path, "navigation.counter10");
    }

    #[test]
    fn end_reload_is_empty_for_unknown_plugin() {
        let router = DeltaRouter::new();
        assert!(router.end_reload("nonexistent").is_empty());
    }

    #[test]
    fn delivery_resumes_live_once_reload_ends() {
        let router = DeltaRouter::new();
        router.subscribe("plugin-a", "vessels.self.navigation.*");
        router.begin_reload("plugin-a");
        router.publish(delta("vessels.self", "navigation.speed"));
        let buffered = router.end_reload("plugin-a");
        assert_eq!(buffered.len(), 1);

        let delivered = router.publish(delta("vessels.self", "navigation.heading"));
        assert_eq!(delivered, vec!["plugin-a".to_string()]);
    }

    #[test]
    fn non_matching_deltas_are_never_buffered_during_reload() {
        let router = DeltaRouter::new();
        router.subscribe("plugin-a", "vessels.self.navigation.*");
        router.begin_reload("plugin-a");
        router.publish(delta("vessels.self", "environment.wind.speedTrue"));
        assert!(router.end_reload("plugin-a").is_empty());
    }
}
