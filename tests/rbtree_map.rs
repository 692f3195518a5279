use std::collections::BTreeMap;

use condup::rbtree::RbTreeMap;
use condup::Backoff;

proptest::proptest! {
    #[test]
    fn rbtree_model_consistent(ops in proptest::collection::vec(
        (proptest::arbitrary::any::<u8>(), proptest::arbitrary::any::<bool>()),
        1..256,
    )) {
        let mut model: BTreeMap<u8, u64> = BTreeMap::new();
        let map: RbTreeMap<u8, u64> = RbTreeMap::new();
        for (i, (k, insert)) in ops.into_iter().enumerate() {
            if insert {
                assert_eq!(map.insert(k, i as u64), model.insert(k, i as u64));
            } else {
                assert_eq!(map.remove(&k), model.remove(&k));
            }
            assert!(map.verify());
        }
        assert_eq!(map.len(), model.len());
        for (k, v) in model.iter() {
            assert_eq!(map.get(k), Some(*v));
        }
    }
}

#[test]
fn rbtree_concurrent_distinct_keys() {
    let map: RbTreeMap<u64, u64> = RbTreeMap::new();
    std::thread::scope(|s| {
        for t in 0..4u64 {
            let map = &map;
            s.spawn(move || {
                for i in 0..256u64 {
                    // Interleaved ranges force the threads onto the same
                    // spines instead of separate subtrees.
                    let k = i * 4 + t;
                    assert_eq!(map.insert(k, k * 2), None);
                }
            });
        }
    });
    assert_eq!(map.len(), 4 * 256);
    for k in 0..1024u64 {
        assert_eq!(map.get(&k), Some(k * 2));
    }
    assert!(map.verify());
}

#[test]
fn rbtree_concurrent_inserts_into_empty() {
    for _ in 0..64 {
        let map: RbTreeMap<u64, u64> = RbTreeMap::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                map.insert(10, 1);
            });
            s.spawn(|| {
                map.insert(20, 2);
            });
        });
        assert_eq!(map.get(&10), Some(1));
        assert_eq!(map.get(&20), Some(2));
        assert_eq!(map.len(), 2);
        assert!(map.verify());
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn rbtree_concurrent_mixed_churn() {
    let _ = tracing_subscriber::fmt::try_init();
    let map: RbTreeMap<u64, u64> = RbTreeMap::with_backoff(Backoff::Spin);
    for k in 0..512u64 {
        map.insert(k, k);
    }
    std::thread::scope(|s| {
        // Two writers toggle disjoint halves while two readers sweep.
        for t in 0..2u64 {
            let map = &map;
            s.spawn(move || {
                let base = t * 256;
                for round in 0..200u64 {
                    for i in 0..256u64 {
                        let k = base + i;
                        assert_eq!(map.remove(&k), Some(k + round));
                        assert_eq!(map.insert(k, k + round + 1), None);
                    }
                }
            });
        }
        for _ in 0..2 {
            let map = &map;
            s.spawn(move || {
                for _ in 0..100 {
                    for k in (0..512u64).step_by(17) {
                        // A reader sees the key present or mid-toggle
                        // absent, never a torn value.
                        if let Some(v) = map.get(&k) {
                            assert!(v >= k && v <= k + 200);
                        }
                    }
                }
            });
        }
    });
    assert_eq!(map.len(), 512);
    for k in 0..512u64 {
        assert_eq!(map.get(&k), Some(k + 200));
    }
    assert!(map.verify());
}
