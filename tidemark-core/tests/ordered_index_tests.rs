use std::collections::BTreeSet;

use proptest::prelude::*;
use rstest::rstest;
use tidemark_core::OrderedIndex;

type StrIndex = OrderedIndex<i64, &'static str>;

// ============================================================================
// Point and range scenarios
// ============================================================================

#[rstest]
#[case::unique(true)]
#[case::non_unique(false)]
fn empty_index_probes_come_back_empty(#[case] unique: bool) {
    let index = StrIndex::new(unique);

    assert!(index.get_value(&5).is_empty());
    assert!(index.begin().is_end());
    assert!(index.begin_at(&5).is_end());
    assert!(index.is_empty());
    assert!(!index.needs_gc());
    assert_eq!(index.memory_footprint(), 0);
}

#[test]
fn duplicate_keys_probe_and_delete() {
    let index = StrIndex::new(false);
    assert!(index.insert(1, "a"));
    assert!(index.insert(1, "b"));
    assert!(index.insert(2, "c"));
    assert!(index.insert(1, "d"));

    // Equal-key runs read newest-first.
    assert_eq!(index.get_value(&1), vec!["d", "b", "a"]);
    assert_eq!(index.get_value(&2), vec!["c"]);

    assert!(index.delete(&1, &"b"));
    assert_eq!(index.get_value(&1), vec!["d", "a"]);
    assert!(!index.delete(&1, &"b"));
}

#[test]
fn unique_mode_refuses_second_key() {
    let index = StrIndex::new(true);
    assert!(index.insert(7, "x"));
    assert!(!index.insert(7, "y"));
    assert_eq!(index.get_value(&7), vec!["x"]);
}

#[test]
fn range_scan_from_lower_bound() {
    let index = StrIndex::new(false);
    for (key, value) in [(1, "a"), (3, "b"), (3, "c"), (5, "d"), (7, "e")] {
        assert!(index.insert(key, value));
    }

    let mut cursor = index.begin_at(&3);
    let mut seen = Vec::new();
    while !cursor.is_end() {
        let (key, value) = cursor.entry().unwrap();
        if *key > 6 {
            break;
        }
        seen.push((*key, *value));
        cursor.advance();
    }

    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(key, _)| *key == 3 || *key == 5));
}

#[test]
fn tie_break_puts_new_entries_ahead_of_the_run() {
    let index = StrIndex::new(false);
    index.insert(3, "first");
    index.insert(3, "second");
    index.insert(3, "third");

    assert_eq!(index.get_value(&3), vec!["third", "second", "first"]);
}

// ============================================================================
// Membership and conditional operations
// ============================================================================

#[test]
fn contains_tracks_live_entries_only() {
    let index = StrIndex::new(false);
    index.insert(4, "a");
    index.insert(4, "b");

    assert!(index.contains(&4));
    assert!(index.contains_pair(&4, &"a"));
    assert!(!index.contains_pair(&4, &"z"));

    index.delete(&4, &"a");
    index.delete(&4, &"b");
    assert!(!index.contains(&4));
    assert!(!index.contains_pair(&4, &"a"));
}

#[test]
fn conditional_find_checks_live_values() {
    let index = StrIndex::new(false);
    index.insert(9, "keep");
    index.insert(9, "drop");
    index.delete(&9, &"drop");

    assert!(index.conditional_find(&9, |v| *v == "keep"));
    assert!(!index.conditional_find(&9, |v| *v == "drop"));
    assert!(!index.conditional_find(&8, |_| true));
}

#[test]
fn conditional_insert_refuses_on_predicate_hit() {
    let index = StrIndex::new(false);
    index.insert(2, "present");

    let refused = index.conditional_insert(2, "next", |v| *v == "present");
    assert!(!refused.inserted);
    assert!(refused.predicate_satisfied);
    assert_eq!(index.get_value(&2), vec!["present"]);

    let accepted = index.conditional_insert(2, "next", |v| *v == "absent");
    assert!(accepted.inserted);
    assert!(!accepted.predicate_satisfied);
    assert_eq!(index.get_value(&2).len(), 2);
}

// ============================================================================
// Cursor behavior
// ============================================================================

#[test]
fn cursor_sees_tombstoned_entries() {
    let index = StrIndex::new(false);
    index.insert(1, "a");
    index.insert(2, "b");

    let mut cursor = index.begin();
    assert!(index.delete(&1, &"a"));

    // The cursor was positioned before the delete; the unlinked entry stays
    // readable under its pin and is reported tombstoned.
    assert_eq!(cursor.entry(), Some((&1, &"a")));
    assert!(cursor.is_tombstoned());
    cursor.advance();
    assert_eq!(cursor.key(), Some(&2));
    assert!(!cursor.is_tombstoned());
}

#[test]
fn cursor_comparisons_order_by_key() {
    let index = StrIndex::new(false);
    index.insert(1, "a");
    index.insert(5, "e");

    let low = index.begin_at(&1);
    let low_again = index.begin_at(&1);
    let high = index.begin_at(&5);
    let end = index.begin_at(&9);
    let end_again = index.begin_at(&10);

    assert!(low < high);
    assert!(low == low_again);
    assert!(low != high);
    // Every positioned cursor sorts before an exhausted one, and two
    // exhausted cursors are equal.
    assert!(high < end);
    assert!(end == end_again);
}

#[test]
fn iterator_yields_live_entries_in_order() {
    let index = StrIndex::new(false);
    for (key, value) in [(4, "d"), (1, "a"), (3, "c"), (2, "b"), (5, "e")] {
        index.insert(key, value);
    }
    index.delete(&3, &"c");

    let entries: Vec<(i64, &str)> = index.begin().collect();
    assert_eq!(entries, vec![(1, "a"), (2, "b"), (4, "d"), (5, "e")]);
}

// ============================================================================
// Footprint and reclamation round trips
// ============================================================================

#[test]
fn delete_restores_probe_and_footprint() {
    let index = OrderedIndex::<i64, i64>::new(false);
    index.insert(10, 100);
    index.insert(20, 200);
    index.perform_gc();
    let before_values = index.get_value(&10);
    let before_bytes = index.memory_footprint();

    assert!(index.insert(10, 101));
    assert!(index.delete(&10, &101));
    assert!(index.needs_gc());
    index.perform_gc();

    assert_eq!(index.get_value(&10), before_values);
    assert_eq!(index.memory_footprint(), before_bytes);
    assert!(!index.needs_gc());
}

#[test]
fn second_insert_and_second_delete_are_idempotent() {
    let index = OrderedIndex::<i64, i64>::new(false);
    assert!(index.insert(1, 2));
    assert!(!index.insert(1, 2));
    assert!(index.delete(&1, &2));
    assert!(!index.delete(&1, &2));
}

// ============================================================================
// Model-checked quiescent invariants
// ============================================================================

#[derive(Clone, Debug)]
enum Op {
    Insert(i8, i8),
    Delete(i8, i8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<i8>(), any::<i8>()).prop_map(|(k, v)| Op::Insert(k, v)),
        (any::<i8>(), any::<i8>()).prop_map(|(k, v)| Op::Delete(k, v)),
    ]
}

proptest! {
    #[test]
    fn quiescent_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..256)) {
        let index = OrderedIndex::<i8, i8>::new(false);
        let mut model: BTreeSet<(i8, i8)> = BTreeSet::new();

        for op in &ops {
            match *op {
                Op::Insert(key, value) => {
                    let expected = model.insert((key, value));
                    prop_assert_eq!(index.insert(key, value), expected);
                }
                Op::Delete(key, value) => {
                    let expected = model.remove(&(key, value));
                    prop_assert_eq!(index.delete(&key, &value), expected);
                }
            }
        }

        // Level-0 traversal is non-decreasing and carries each live pair once.
        let entries: Vec<(i8, i8)> = index.begin().collect();
        let keys: Vec<i8> = entries.iter().map(|(key, _)| *key).collect();
        let mut sorted_keys = keys.clone();
        sorted_keys.sort();
        prop_assert_eq!(&keys, &sorted_keys);

        let distinct: BTreeSet<(i8, i8)> = entries.iter().copied().collect();
        prop_assert_eq!(distinct.len(), entries.len());
        prop_assert_eq!(&distinct, &model);

        for (key, value) in &model {
            prop_assert!(index.get_value(key).contains(value));
        }

        index.perform_gc();
        prop_assert!(!index.needs_gc());
    }

    #[test]
    fn unique_mode_keeps_one_value_per_key(ops in proptest::collection::vec(op_strategy(), 1..256)) {
        let index = OrderedIndex::<i8, i8>::new(true);
        let mut model: std::collections::BTreeMap<i8, i8> = std::collections::BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Insert(key, value) => {
                    let expected = !model.contains_key(&key);
                    prop_assert_eq!(index.insert(key, value), expected);
                    model.entry(key).or_insert(value);
                }
                Op::Delete(key, value) => {
                    let expected = model.get(&key) == Some(&value);
                    prop_assert_eq!(index.delete(&key, &value), expected);
                    if expected {
                        model.remove(&key);
                    }
                }
            }
        }

        for (key, value) in &model {
            prop_assert_eq!(index.get_value(key), vec![*value]);
        }
        prop_assert_eq!(index.len(), model.len());
    }
}
