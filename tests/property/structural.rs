//! Properties of the canonical codec, structural hash and structural diff

use converge::codec::{self, structural_hash, Value};
use converge::diff::diff;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Arbitrary structural values, a few levels deep.
fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        "[a-z ]{0,12}".prop_map(Value::text),
        "[a-f0-9-]{1,16}".prop_map(Value::opaque),
    ];
    leaf.prop_recursive(3, 48, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Sequence),
            prop::collection::btree_set(inner.clone(), 0..4).prop_map(Value::Set),
            prop::collection::btree_map(inner.clone(), inner.clone(), 0..4)
                .prop_map(Value::Map),
            (
                prop::sample::select(vec!["Node", "Dataset", "Probe"]),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
            )
                .prop_map(|(tag, fields)| Value::Record {
                    tag: tag.to_string(),
                    fields,
                }),
        ]
    })
}

#[test]
fn test_encoding_roundtrips_every_value() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&value_strategy(), |value| {
            let decoded = codec::decode(&codec::encode(&value)).unwrap();
            prop_assert_eq!(decoded, value);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_encoding_and_hash_are_deterministic() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&value_strategy(), |value| {
            prop_assert_eq!(codec::encode(&value), codec::encode(&value.clone()));
            prop_assert_eq!(structural_hash(&value), structural_hash(&value.clone()));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_set_hash_ignores_construction_order() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::vec(value_strategy(), 0..8),
            |mut items| {
                let forward = Value::set(items.clone());
                items.reverse();
                let reversed = Value::set(items);
                prop_assert_eq!(structural_hash(&forward), structural_hash(&reversed));
                Ok(())
            },
        )
        .unwrap();
}

#[test]
fn test_hash_distinguishes_different_values() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(value_strategy(), value_strategy()),
            |(a, b)| {
                if a != b {
                    // Truncated blake3 collisions are negligible at test scale.
                    prop_assert_ne!(structural_hash(&a), structural_hash(&b));
                }
                Ok(())
            },
        )
        .unwrap();
}

#[test]
fn test_diff_apply_reconstructs_the_target() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(value_strategy(), value_strategy()),
            |(a, b)| {
                let delta = diff(&a, &b);
                prop_assert_eq!(delta.apply(&a).unwrap(), b);
                Ok(())
            },
        )
        .unwrap();
}

#[test]
fn test_diff_of_equal_values_is_empty() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&value_strategy(), |value| {
            prop_assert!(diff(&value, &value.clone()).is_empty());
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_composed_diffs_replay_a_history() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::vec(value_strategy(), 2..6),
            |history| {
                let mut composed = converge::diff::Diff::empty();
                for pair in history.windows(2) {
                    composed = composed.compose(diff(&pair[0], &pair[1]));
                }
                let last = history.last().unwrap();
                prop_assert_eq!(&composed.apply(&history[0]).unwrap(), last);
                Ok(())
            },
        )
        .unwrap();
}

/// Field-level proportionality: one changed field in a wide record diffs to
/// one operation, not a snapshot replacement.
#[test]
fn test_diff_is_proportional_to_the_change() {
    let wide = |changed: i64| {
        Value::Record {
            tag: "Node".to_string(),
            fields: (0..64)
                .map(|i| (format!("field{:02}", i), Value::Int(i)))
                .chain([("changed".to_string(), Value::Int(changed))])
                .collect::<BTreeMap<_, _>>(),
        }
    };
    let delta = diff(&wide(0), &wide(1));
    assert_eq!(delta.ops().len(), 1);
}
