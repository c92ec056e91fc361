//! Property-based tests for the storage primitives.
//!
//! Run with: `cargo test --test proptest_tests`

use proptest::prelude::*;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tierweave::config::{CompressionConfig, RetentionConfig};
use tierweave::schema::SchemaRegistry;
use tierweave::watch::glob_to_regex;
use tierweave::{Algorithm, CompressionEngine, MemoryValue, Namespace, Tier, TieredStore, WeaveError};

// =============================================================================
// Strategies
// =============================================================================

fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9_.-]{0,11}"
}

fn namespace_strategy() -> impl Strategy<Value = Namespace> {
    (segment_strategy(), segment_strategy(), segment_strategy())
        .prop_map(|(p, c, m)| Namespace::new(p, c, m).unwrap())
}

fn tier_strategy() -> impl Strategy<Value = Tier> {
    prop_oneof![Just(Tier::ShortTerm), Just(Tier::Working), Just(Tier::LongTerm)]
}

fn json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[ -~]{0,40}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 48, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..8)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn value_strategy() -> impl Strategy<Value = MemoryValue> {
    prop_oneof![
        json_strategy().prop_map(MemoryValue::structured),
        prop::collection::vec(any::<u8>(), 0..2048)
            .prop_map(|b| MemoryValue::bytes(b, "application/octet-stream")),
        (json_strategy(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(|(document, bytes)| {
            MemoryValue::Mixed {
                document,
                bytes,
                mime: "audio/wav".into(),
            }
        }),
    ]
}

fn small_threshold_store() -> TieredStore {
    TieredStore::new(
        Arc::new(CompressionEngine::new(CompressionConfig {
            threshold_bytes: 32,
            ..Default::default()
        })),
        Arc::new(SchemaRegistry::new()),
        RetentionConfig::default(),
    )
}

// =============================================================================
// Compression
// =============================================================================

proptest! {
    #[test]
    fn compression_round_trips(bytes in prop::collection::vec(any::<u8>(), 0..8192)) {
        let engine = CompressionEngine::new(CompressionConfig {
            threshold_bytes: 64,
            ..Default::default()
        });
        let (algorithm, packed) = engine.compress(&bytes, bytes.len()).unwrap();
        if bytes.len() < 64 {
            prop_assert_eq!(algorithm, Algorithm::Raw);
        }
        prop_assert_eq!(engine.decompress(algorithm, &packed).unwrap(), bytes);
    }

    #[test]
    fn decompress_never_panics_on_garbage(bytes in prop::collection::vec(any::<u8>(), 0..1024)) {
        let engine = CompressionEngine::default();
        for algorithm in [Algorithm::DeflateFast, Algorithm::ZlibMax] {
            match engine.decompress(algorithm, &bytes) {
                Ok(_) => {}
                Err(WeaveError::CorruptData { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }
    }
}

// =============================================================================
// Store
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn store_returns_last_write(
        namespace in namespace_strategy(),
        tier in tier_strategy(),
        writes in prop::collection::vec(("[a-z]{1,4}", value_strategy()), 1..24),
    ) {
        let store = small_threshold_store();
        let mut expected: HashMap<String, (u64, MemoryValue)> = HashMap::new();

        for (key, value) in &writes {
            let revision = store.put(&namespace, tier, key, value, BTreeMap::new()).unwrap();
            let previous = expected.get(key).map(|(rev, _)| *rev).unwrap_or(0);
            prop_assert_eq!(revision, previous + 1);
            expected.insert(key.clone(), (revision, value.clone()));
        }

        for (key, (revision, value)) in &expected {
            let record = store.get(&namespace, tier, key).unwrap();
            prop_assert_eq!(record.revision, *revision);
            prop_assert_eq!(&record.value, value);
            prop_assert_eq!(store.history(&namespace, tier, key).unwrap().len() as u64, *revision);
        }
    }

    #[test]
    fn namespace_display_parses_back(namespace in namespace_strategy()) {
        let parsed: Namespace = namespace.to_string().parse().unwrap();
        prop_assert_eq!(parsed, namespace);
    }

    #[test]
    fn star_glob_stays_within_one_segment(dir in "[a-z]{1,8}", file in "[a-z]{1,8}") {
        let re = glob_to_regex("*.txt").unwrap();
        let nested = format!("{dir}/{file}.txt");
        let flat = format!("{file}.txt");
        prop_assert!(re.is_match(&flat));
        prop_assert!(!re.is_match(&nested));
        prop_assert!(glob_to_regex("**/*.txt").unwrap().is_match(&nested));
    }
}

#[test]
fn structured_values_survive_compression() {
    let store = small_threshold_store();
    let ns: Namespace = "acme/research/notes".parse().unwrap();
    let value = MemoryValue::structured(json!({"transcript": "a".repeat(400)}));
    store.put(&ns, Tier::Working, "long", &value, BTreeMap::new()).unwrap();

    let record = store.get(&ns, Tier::Working, "long").unwrap();
    assert!(record.compressed);
    assert_eq!(record.value, value);
}
