//! Property-based tests using proptest.
//!
//! Exercises the core invariants:
//! - last-version-wins is insensitive to physical insertion order
//! - tombstones exclude keys from every reconciled read
//! - compaction never changes the reconciled view
//! - side-relation flattening is order-independent and idempotent
//! - additive rollup partial counts sum to the direct count
//! - duration parsing round-trips composed values

use proptest::prelude::*;

use cascade::{
    ColumnDef, DataType, Row, TableDef, Value, Version, VersionedTable, flatten_ids,
    scheduler::parse_duration,
};

fn table() -> VersionedTable {
    VersionedTable::new(TableDef::replacing(
        "t",
        vec![
            ColumnDef::new("id", DataType::Int64),
            ColumnDef::new("payload", DataType::Int64),
        ],
        &["id"],
    ))
    .unwrap()
}

/// (id, version, payload, deleted) event tuples over a small key space so
/// collisions actually happen.
fn arb_events() -> impl Strategy<Value = Vec<(i64, i64, i64, bool)>> {
    prop::collection::vec(
        (0i64..5, 0i64..20, 0i64..1000, prop::bool::ANY),
        1..40,
    )
}

/// The expected reconciled state computed the obvious way: for each key,
/// the event with the highest (version, position) wins; deleted winners
/// drop the key.
fn naive_reconcile(events: &[(i64, i64, i64, bool)]) -> Vec<(i64, i64)> {
    let mut best: std::collections::BTreeMap<i64, (i64, usize, i64, bool)> =
        std::collections::BTreeMap::new();
    for (pos, (id, version, payload, deleted)) in events.iter().enumerate() {
        let keep_existing = best
            .get(id)
            .is_some_and(|(v, p, _, _)| (*v, *p) > (*version, pos));
        if !keep_existing {
            best.insert(*id, (*version, pos, *payload, *deleted));
        }
    }
    best.into_iter()
        .filter(|(_, (_, _, _, deleted))| !deleted)
        .map(|(id, (_, _, payload, _))| (id, payload))
        .collect()
}

fn apply_events(t: &VersionedTable, events: &[(i64, i64, i64, bool)]) {
    for (id, version, payload, deleted) in events {
        let values = vec![Value::Int64(*id), Value::Int64(*payload)];
        let row = if *deleted {
            Row::tombstone(values, Version(*version))
        } else {
            Row::new(values, Version(*version))
        };
        t.append(vec![row]).unwrap();
    }
}

fn reconciled_pairs(t: &VersionedTable) -> Vec<(i64, i64)> {
    t.reconciled()
        .iter()
        .map(|r| {
            (
                r.values[0].as_i64().unwrap(),
                r.values[1].as_i64().unwrap(),
            )
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    // ── Last-version-wins ──────────────────────────────────────────

    #[test]
    fn prop_reconcile_matches_naive_model(events in arb_events()) {
        let t = table();
        apply_events(&t, &events);
        prop_assert_eq!(reconciled_pairs(&t), naive_reconcile(&events));
    }

    #[test]
    fn prop_duplicate_delivery_changes_nothing(events in arb_events()) {
        let t = table();
        apply_events(&t, &events);
        let once = reconciled_pairs(&t);

        // At-least-once delivery: replay the entire stream.
        apply_events(&t, &events);
        prop_assert_eq!(reconciled_pairs(&t), once);
    }

    #[test]
    fn prop_compaction_preserves_reconciled_view(events in arb_events()) {
        let t = table();
        apply_events(&t, &events);
        let before = t.reconciled();
        t.compact();
        prop_assert_eq!(t.reconciled(), before);
    }

    #[test]
    fn prop_tombstone_always_excludes(
        events in arb_events(),
        key in 0i64..5,
    ) {
        let t = table();
        apply_events(&t, &events);
        // A tombstone strictly above every version in play.
        t.append(vec![Row::tombstone(
            vec![Value::Int64(key), Value::Int64(0)],
            Version(1000),
        )])
        .unwrap();
        prop_assert!(
            reconciled_pairs(&t).iter().all(|(id, _)| *id != key),
            "key {} survived its tombstone", key
        );
    }

    // ── Flattening ─────────────────────────────────────────────────

    #[test]
    fn prop_flatten_order_independent(mut ids in prop::collection::vec(-100i64..100, 0..20)) {
        let forward = flatten_ids(&ids, '/');
        ids.reverse();
        let backward = flatten_ids(&ids, '/');
        prop_assert_eq!(&forward, &backward);

        // Idempotence under re-folding of the same set.
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(flatten_ids(&ids, '/'), forward);
    }

    #[test]
    fn prop_flatten_is_wrapped_and_sorted(ids in prop::collection::vec(0i64..50, 1..20)) {
        let s = flatten_ids(&ids, '/');
        prop_assert!(s.starts_with('/') && s.ends_with('/'));
        let parsed: Vec<i64> = s
            .split('/')
            .filter(|p| !p.is_empty())
            .map(|p| p.parse().unwrap())
            .collect();
        let mut expected: Vec<i64> = ids.clone();
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(parsed, expected);
    }

    // ── Additive state ─────────────────────────────────────────────

    #[test]
    fn prop_partial_counts_sum_to_direct_count(
        counts in prop::collection::vec(1u64..50, 1..10),
    ) {
        // Append one partial-count row per "batch" with distinct versions;
        // the merged bucket must equal the sum.
        let t = VersionedTable::new(TableDef::additive(
            "agg",
            vec![
                ColumnDef::new("k", DataType::Int64),
                ColumnDef::new("count", DataType::UInt64),
            ],
            &["k"],
        ))
        .unwrap();
        for (i, c) in counts.iter().enumerate() {
            t.append(vec![Row::new(
                vec![Value::Int64(1), Value::UInt64(*c)],
                Version(i as i64),
            )])
            .unwrap();
        }
        let rows = t.reconciled();
        prop_assert_eq!(rows.len(), 1);
        prop_assert_eq!(
            rows[0].values[1].clone(),
            Value::UInt64(counts.iter().sum())
        );
    }

    // ── Duration grammar ───────────────────────────────────────────

    #[test]
    fn prop_parse_duration_compound_roundtrip(h in 0i64..100, m in 0i64..60, s in 1i64..60) {
        let text = format!("{h}h{m}m{s}s");
        prop_assert_eq!(parse_duration(&text).unwrap(), h * 3600 + m * 60 + s);
    }
}
