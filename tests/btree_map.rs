use std::collections::BTreeMap;

use condup::btree::BtreeMap;
use condup::Backoff;
use rand::seq::SliceRandom;

proptest::proptest! {
    #[test]
    fn btree_model_consistent(ops in proptest::collection::vec(
        (proptest::arbitrary::any::<u8>(), proptest::arbitrary::any::<bool>()),
        1..256,
    )) {
        let mut model: BTreeMap<u8, u64> = BTreeMap::new();
        let map: BtreeMap<u8, u64> = BtreeMap::new();
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

    #[test]
    fn btree_get_consistent(values: std::collections::BTreeSet<u8>, key: u8) {
        let model = BTreeMap::from_iter(values.iter().cloned().map(|v| (v, v)));
        let map: BtreeMap<u8, u8> = BtreeMap::from_iter(values.iter().cloned().map(|v| (v, v)));
        assert_eq!(map.get(&key), model.get(&key).cloned());
    }
}

#[test]
fn btree_shuffled_fill_and_drain() {
    let mut keys: Vec<u64> = (0..2048).collect();
    let mut rng = rand::rng();
    keys.shuffle(&mut rng);

    let map: BtreeMap<u64, u64> = BtreeMap::new();
    for &k in keys.iter() {
        assert_eq!(map.insert(k, k * 7), None);
    }
    assert_eq!(map.len(), 2048);
    assert!(map.verify());

    keys.shuffle(&mut rng);
    for &k in keys.iter() {
        assert_eq!(map.remove(&k), Some(k * 7));
    }
    assert!(map.is_empty());
    assert!(map.verify());
}

#[test]
fn btree_concurrent_distinct_keys() {
    let map: BtreeMap<u64, u64> = BtreeMap::new();
    std::thread::scope(|s| {
        for t in 0..4u64 {
            let map = &map;
            s.spawn(move || {
                for i in 0..256u64 {
                    // Interleaved ranges keep the threads splitting the
                    // same leaves.
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
fn btree_concurrent_inserts_into_empty() {
    for _ in 0..64 {
        let map: BtreeMap<u64, u64> = BtreeMap::new();
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
fn btree_concurrent_split_merge_churn() {
    let _ = tracing_subscriber::fmt::try_init();
    let map: BtreeMap<u64, u64> = BtreeMap::with_backoff(Backoff::Spin);
    for k in 0..256u64 {
        map.insert(k, k);
    }
    std::thread::scope(|s| {
        // Each writer drains and refills its own stripe, driving the
        // shared upper levels through splits and merges while readers
        // sweep the whole range.
        for t in 0..2u64 {
            let map = &map;
            s.spawn(move || {
                for _ in 0..100 {
                    for i in 0..128u64 {
                        let k = i * 2 + t;
                        assert!(map.remove(&k).is_some());
                    }
                    for i in 0..128u64 {
                        let k = i * 2 + t;
                        assert_eq!(map.insert(k, k), None);
                    }
                }
            });
        }
        for _ in 0..2 {
            let map = &map;
            s.spawn(move || {
                for _ in 0..200 {
                    for k in (0..256u64).step_by(13) {
                        if let Some(v) = map.get(&k) {
                            assert_eq!(v, k);
                        }
                    }
                }
            });
        }
    });
    assert_eq!(map.len(), 256);
    assert!(map.verify());
    for k in 0..256u64 {
        assert_eq!(map.get(&k), Some(k));
    }
}
