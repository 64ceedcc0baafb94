//! Property-based tests for SDK serialization invariants

use proptest::prelude::*;
use sdk::types::{Delta, PathValue, PluginConfigFile};

fn json_leaf() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(serde_json::Value::from),
    ]
}

fn json_config() -> impl Strategy<Value = serde_json::Value> {
    prop::collection::btree_map("[a-z_]{1,10}", json_leaf(), 0..6).prop_map(|map| {
        serde_json::Value::Object(map.into_iter().collect())
    })
}

proptest! {
    #[test]
    fn config_file_round_trips_through_canonical_json(
        enabled in any::<bool>(),
        configuration in json_config(),
    ) {
        let config = PluginConfigFile { enabled, configuration };
        let text = serde_json::to_string_pretty(&config).unwrap();
        let back: PluginConfigFile = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(config, back);
    }

    #[test]
    fn delta_round_trips(
        context in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}",
        path in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}",
        value in json_leaf(),
    ) {
        let delta = Delta {
            context,
            source: None,
            timestamp: None,
            values: vec![PathValue { path, value }],
        };
        let text = serde_json::to_string(&delta).unwrap();
        let back: Delta = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(delta, back);
    }

    #[test]
    fn full_paths_join_context_and_path(
        context in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}",
        path in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}",
    ) {
        let delta = Delta {
            context: context.clone(),
            source: None,
            timestamp: None,
            values: vec![PathValue { path: path.clone(), value: serde_json::Value::Null }],
        };
        let full: Vec<String> = delta.full_paths().collect();
        prop_assert_eq!(full, vec![format!("{context}.{path}")]);
    }
}
