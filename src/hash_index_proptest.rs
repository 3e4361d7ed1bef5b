#![cfg(test)]

// Property tests for ExtendibleHash kept inside the crate so every step can
// be checked against the private structural invariants via `validate`.

use crate::hash_index::{ExtendibleHash, HashIndexError};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};

// Pool-indexed operations to improve shrinking: indices shrink to earlier keys,
// pool length shrinks, and op lists shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    Insert(usize, i32),
    Remove(usize),
    Lookup(usize),
    SetValue(usize, i32),
    Iterate,
    Cursor,
}

fn arb_ops(pool_len: usize) -> impl Strategy<Value = Vec<OpI>> {
    let idx = 0..pool_len;
    let op = prop_oneof![
        3 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::Insert(i, v)),
        1 => idx.clone().prop_map(OpI::Remove),
        2 => idx.clone().prop_map(OpI::Lookup),
        1 => (idx, any::<i32>()).prop_map(|(i, v)| OpI::SetValue(i, v)),
        1 => Just(OpI::Iterate),
        1 => Just(OpI::Cursor),
    ];
    proptest::collection::vec(op, 1..120)
}

// Full-entropy keys: the common case of well-mixed hashes.
fn arb_scenario() -> impl Strategy<Value = (usize, Vec<u64>, Vec<OpI>)> {
    (1usize..=4, proptest::collection::vec(any::<u64>(), 1..=40)).prop_flat_map(|(cap, pool)| {
        let n = pool.len();
        (Just(cap), Just(pool), arb_ops(n))
    })
}

// Low-entropy keys: only a few distinct high bits, so many keys share long
// low-bit prefixes and splits cascade.
fn arb_low_entropy_scenario() -> impl Strategy<Value = (usize, Vec<u64>, Vec<OpI>)> {
    let key = (0u64..8, 0u32..12).prop_map(|(v, shift)| v << shift);
    (1usize..=3, proptest::collection::vec(key, 1..=24)).prop_flat_map(|(cap, pool)| {
        let n = pool.len();
        (Just(cap), Just(pool), arb_ops(n))
    })
}

fn run(cap: usize, pool: &[u64], ops: Vec<OpI>) -> Result<(), TestCaseError> {
    let mut sut: ExtendibleHash<i32> = ExtendibleHash::new(cap).unwrap();
    let mut model: HashMap<u64, i32> = HashMap::new();
    let mut last_depth = 0;

    for op in ops {
        match op {
            OpI::Insert(i, v) => {
                let k = pool[i];
                let already = model.contains_key(&k);
                match sut.insert(k, v) {
                    Ok(()) => {
                        prop_assert!(!already, "insert must fail on duplicate");
                        model.insert(k, v);
                    }
                    Err(HashIndexError::DuplicateKey(dk)) => {
                        prop_assert!(already, "duplicate error only when key exists");
                        prop_assert_eq!(dk, k);
                    }
                    Err(e) => prop_assert!(false, "unexpected error {e:?}"),
                }
            }
            OpI::Remove(i) => {
                let k = pool[i];
                prop_assert_eq!(sut.remove(k), model.remove(&k));
                prop_assert!(!sut.contains_key(k));
            }
            OpI::Lookup(i) => {
                let k = pool[i];
                prop_assert_eq!(sut.lookup(k), model.get(&k));
            }
            OpI::SetValue(i, v) => {
                let k = pool[i];
                match model.get_mut(&k) {
                    Some(mv) => {
                        let prev = sut.set_value(k, v).unwrap();
                        prop_assert_eq!(prev, std::mem::replace(mv, v));
                    }
                    None => prop_assert_eq!(sut.set_value(k, v), Err(HashIndexError::KeyNotFound(k))),
                }
            }
            OpI::Iterate => {
                let seen: BTreeMap<u64, i32> = sut.iter().map(|(k, v)| (k, *v)).collect();
                prop_assert_eq!(seen.len(), sut.iter().count(), "iteration yields each key once");
                let expect: BTreeMap<u64, i32> = model.iter().map(|(k, v)| (*k, *v)).collect();
                prop_assert_eq!(seen, expect);
            }
            OpI::Cursor => {
                let mut cursor = sut.cursor().unwrap();
                prop_assert!(sut.is_iterating());
                prop_assert_eq!(sut.cursor().err(), Some(HashIndexError::IterationInProgress));
                let first: Vec<u64> = cursor.by_ref().map(|(k, _)| k).collect();
                cursor.reset();
                let second: Vec<u64> = cursor.map(|(k, _)| k).collect();
                prop_assert_eq!(&first, &second);
                prop_assert_eq!(first.len(), model.len());
                prop_assert!(!sut.is_iterating());
            }
        }
        // Grow-only: depth never decreases, even across removals.
        prop_assert!(sut.global_depth() >= last_depth);
        last_depth = sut.global_depth();
        prop_assert_eq!(sut.directory_len(), 1usize << sut.global_depth());
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
        if let Err(v) = sut.validate() {
            prop_assert!(false, "{v}");
        }
    }
    Ok(())
}

// Property: State-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - Duplicate keys are rejected; lookups agree with the model.
// - `remove` returns the model's value and the key is gone afterwards.
// - `iter` and the cursor yield each live entry exactly once.
// - A second cursor is refused while the first is alive.
// - Directory length is 2^global_depth; every leaf satisfies the split invariant.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((cap, pool, ops) in arb_scenario()) {
        run(cap, &pool, ops)?;
    }

    #[test]
    fn prop_state_machine_low_entropy((cap, pool, ops) in arb_low_entropy_scenario()) {
        run(cap, &pool, ops)?;
    }
}
