//! Multi-plugin delta routing scenarios: pattern matching across several
//! simultaneous subscribers, `vessels.self` alias canonicalization, and
//! the reload-replay ordering guarantee (§5, §8 property 3) — broader
//! scenarios than the single-router unit tests in `delta.rs` cover.

use skwasm_host::delta::Delta;
use skwasm_host::delta::DeltaRouter;

fn delta(context: &str, path: &str, value: f64) -> Delta {
    Delta {
        context: context.to_string(),
        path: path.to_string(),
        value: serde_json::json!(value),
        timestamp_ms: 0,
    }
}

#[test]
fn publish_fans_out_to_every_matching_subscriber_and_skips_the_rest() {
    let router = DeltaRouter::new();
    router.subscribe("anchor-alarm", "vessels.self.navigation.position");
    router.subscribe("wind-logger", "vessels.self.environment.wind.*");
    router.subscribe("everything-logger", "vessels.self.*.*");

    let delivered = router.publish(delta("vessels.self", "navigation.position", 1.0));
    assert!(delivered.contains(&"anchor-alarm".to_string()));
    assert!(!delivered.contains(&"wind-logger".to_string()));
    assert!(!delivered.contains(&"everything-logger".to_string())); // three segments, pattern wants two
}

#[test]
fn literal_self_alias_and_canonical_context_both_match_a_canonical_subscription() {
    let router = DeltaRouter::new();
    router.subscribe("plugin-a", "vessels.self.navigation.speed");

    let via_alias = router.publish(delta("self", "navigation.speed", 4.2));
    let via_canonical = router.publish(delta("vessels.self", "navigation.speed", 4.3));
    assert_eq!(via_alias, vec!["plugin-a".to_string()]);
    assert_eq!(via_canonical, vec!["plugin-a".to_string()]);
}

#[test]
fn reload_buffers_only_the_reloading_plugins_deltas_and_replays_in_order() {
    let router = DeltaRouter::new();
    router.subscribe("reloading-plugin", "vessels.self.navigation.speed");
    router.subscribe("steady-plugin", "vessels.self.navigation.speed");

    router.begin_reload("reloading-plugin");

    let first = router.publish(delta("vessels.self", "navigation.speed", 1.0));
    let second = router.publish(delta("vessels.self", "navigation.speed", 2.0));

    // The steady plugin keeps receiving live deliveries throughout.
    assert_eq!(first, vec!["steady-plugin".to_string()]);
    assert_eq!(second, vec!["steady-plugin".to_string()]);

    let replayed = router.end_reload("reloading-plugin");
    let values: Vec<f64> = replayed.iter().map(|d| d.value.as_f64().unwrap()).collect();
    assert_eq!(values, vec![1.0, 2.0]);

    // After the reload window closes, delivery goes live again immediately.
    let third = router.publish(delta("vessels.self", "navigation.speed", 3.0));
    assert_eq!(third.len(), 2);
    assert!(third.contains(&"reloading-plugin".to_string()));
}

#[test]
fn unsubscribe_all_drops_every_pattern_for_that_plugin_only() {
    let router = DeltaRouter::new();
    router.subscribe("plugin-a", "vessels.self.navigation.speed");
    router.subscribe("plugin-a", "vessels.self.navigation.heading");
    router.subscribe("plugin-b", "vessels.self.navigation.speed");

    router.unsubscribe_all("plugin-a");

    assert_eq!(router.subscription_count("plugin-a"), 0);
    assert_eq!(router.subscription_count("plugin-b"), 1);

    let delivered = router.publish(delta("vessels.self", "navigation.speed", 5.0));
    assert_eq!(delivered, vec!["plugin-b".to_string()]);
}

#[test]
fn replay_buffer_drops_oldest_past_its_capacity() {
    let router = DeltaRouter::new();
    router.subscribe("reloading-plugin", "vessels.self.navigation.speed");
    router.begin_reload("reloading-plugin");

    for i in 0..1100 {
        router.publish(delta("vessels.self", "navigation.speed", i as f64));
    }

    let replayed = router.end_reload("reloading-plugin");
    assert_eq!(replayed.len(), 1000);
    assert_eq!(replayed.front().unwrap().value.as_f64().unwrap(), 100.0);
    assert_eq!(replayed.back().unwrap().value.as_f64().unwrap(), 1099.0);
}
