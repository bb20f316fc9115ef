// Structural and behavioral tests for the order-statistic B+ tree.

use ordered_float::OrderedFloat;
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use reservoir::RankTree;

fn tree_of(keys: &[u32]) -> RankTree<u32, u32> {
    let mut t = RankTree::new();
    for (i, &k) in keys.iter().enumerate() {
        t.insert(k, i as u32);
    }
    t
}

#[test]
fn trivial_tree_in_order_and_ranks() {
    let mut t = RankTree::new();
    t.insert(OrderedFloat(5.0), 'A');
    t.insert(OrderedFloat(3.0), 'B');
    t.insert(OrderedFloat(9.0), 'C');
    t.insert(OrderedFloat(1.0), 'D');
    t.verify();

    let in_order: Vec<(f64, char)> = t.iter().map(|(k, v)| (k.0, *v)).collect();
    assert_eq!(in_order, vec![(1.0, 'D'), (3.0, 'B'), (5.0, 'A'), (9.0, 'C')]);

    let (_, v) = t.entry(t.find_rank(2)).unwrap();
    assert_eq!(*v, 'A');
    assert_eq!(t.rank_of_lower_bound(&OrderedFloat(5.0)).0, 2);
    assert_eq!(t.rank_of_upper_bound(&OrderedFloat(5.0)).0, 3);
    assert_eq!(t.rank_of(&OrderedFloat(9.0)).0, 3);
    assert_eq!(t.rank_of(&OrderedFloat(2.0)).0, t.len());
}

#[test]
fn split_at_with_boundary_duplicates() {
    let mut t: RankTree<u32, u32> = RankTree::new();
    t.bulk_load([1u32, 2, 2, 2, 3, 4].into_iter().map(|k| (k, k)));
    t.verify();

    let (left, right) = t.split_at(2);
    assert_eq!(left.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(right.keys().copied().collect::<Vec<_>>(), vec![2, 2, 3, 4]);

    let mut t: RankTree<u32, u32> = RankTree::new();
    t.bulk_load([1u32, 2, 2, 2, 3, 4].into_iter().map(|k| (k, k)));
    let (left, right) = t.split_at(3);
    assert_eq!(left.keys().copied().collect::<Vec<_>>(), vec![1, 2, 2]);
    assert_eq!(right.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
}

#[test]
fn insert_erase_3200_ascending_and_descending() {
    // multimap behavior under heavy duplication
    let mut t: RankTree<u32, u32> = RankTree::new();
    for i in 0..3200u32 {
        t.insert(i % 10, i);
    }
    assert_eq!(t.len(), 3200);
    t.verify();
    for key in 0..10u32 {
        assert_eq!(t.remove_all(&key), 320);
    }
    assert!(t.is_empty());
    t.verify();

    let mut t: RankTree<u32, u32> = RankTree::new();
    for i in (0..3200u32).rev() {
        t.insert(i % 10, i);
    }
    assert_eq!(t.len(), 3200);
    t.verify();
    for key in (0..10u32).rev() {
        for _ in 0..320 {
            assert!(t.remove(&key));
        }
        assert!(!t.remove(&key));
        t.verify();
    }
    assert!(t.is_empty());
}

#[test]
fn random_insert_erase_with_verification() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let mut keys: Vec<u32> = (0..2000).map(|i| i % 500).collect();
    keys.shuffle(&mut rng);

    let mut t = tree_of(&keys);
    t.verify();
    assert_eq!(t.len(), 2000);

    keys.shuffle(&mut rng);
    for (i, key) in keys.iter().enumerate() {
        assert!(t.remove(key), "missing key {key}");
        if i % 97 == 0 {
            t.verify();
        }
    }
    assert!(t.is_empty());
}

#[test]
fn bounds_and_counts_with_duplicates() {
    // keys 0, 3, 6, ... each appearing three times
    let mut t: RankTree<u32, u32> = RankTree::new();
    for rep in 0..3u32 {
        for i in 0..300u32 {
            t.insert(i * 3, rep);
        }
    }
    t.verify();

    for i in 0..300u32 {
        let key = i * 3;
        assert_eq!(t.rank_of_lower_bound(&key).0 as u32, i * 3);
        assert_eq!(t.rank_of_upper_bound(&key).0 as u32, i * 3 + 3);
        // a key between the piles
        assert_eq!(t.rank_of_lower_bound(&(key + 1)).0 as u32, i * 3 + 3);
        assert_eq!(t.rank_of(&(key + 1)).0, t.len());
    }
}

#[test]
fn rank_round_trip_10000() {
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let mut keys: Vec<u32> = (0..10_000).map(|i| i % 3000).collect();
    keys.shuffle(&mut rng);
    let t = tree_of(&keys);

    let sorted: Vec<u32> = {
        let mut s = keys.clone();
        s.sort();
        s
    };
    for r in (0..10_000).step_by(37) {
        let c = t.find_rank(r);
        let (k, _) = t.entry(c).unwrap();
        assert_eq!(*k, sorted[r]);
        assert_eq!(t.rank_of_cursor(c), r);
    }
    assert_eq!(t.find_rank(10_000), t.end());
    assert_eq!(t.rank_of_cursor(t.end()), 10_000);
}

#[test]
fn bulk_load_matches_incremental_build() {
    for n in [0usize, 1, 15, 16, 17, 255, 256, 1000, 4711] {
        let keys: Vec<u32> = (0..n as u32).map(|i| i / 3).collect();
        let mut loaded: RankTree<u32, u32> = RankTree::new();
        loaded.bulk_load(keys.iter().map(|&k| (k, k)));
        loaded.verify();
        assert_eq!(loaded.len(), n);

        let mut built: RankTree<u32, u32> = RankTree::new();
        for &k in &keys {
            built.insert(k, k);
        }
        assert_eq!(loaded, built);
    }
}

#[test]
fn split_by_key_partitions_inclusively() {
    let keys: Vec<u32> = (0..1000).map(|i| (i * 7) % 400).collect();
    let t = tree_of(&keys);
    let (left, right) = t.split(&123);
    left.verify();
    right.verify();
    assert!(left.keys().all(|&k| k <= 123));
    assert!(right.keys().all(|&k| k > 123));
    assert_eq!(left.len() + right.len(), 1000);
    // the pivot itself lands left
    assert!(left.keys().any(|&k| k == 123));
}

#[test]
fn bulk_delete_smallest() {
    let mut t: RankTree<u32, u32> = RankTree::new();
    t.bulk_load((0..10_000u32).map(|k| (k, k)));
    let low = t.bulk_delete(2500);
    low.verify();
    t.verify();
    assert!(low.keys().copied().eq(0..2500));
    assert!(t.keys().copied().eq(2500..10_000));
}

#[test]
#[should_panic(expected = "bulk_load requires an empty tree")]
fn bulk_load_rejects_nonempty() {
    let mut t: RankTree<u32, u32> = RankTree::new();
    t.insert(1, 1);
    t.bulk_load((0..10u32).map(|k| (k, k)));
}

proptest! {
    #[test]
    fn prop_split_join_is_identity(
        keys in prop::collection::vec(0u32..200, 0..400),
        pivot in 0u32..220,
    ) {
        let t = tree_of(&keys);
        let mut sorted = keys.clone();
        sorted.sort();

        let (left, right) = t.split(&pivot);
        left.verify();
        right.verify();
        prop_assert!(left.keys().all(|&k| k <= pivot));
        prop_assert!(right.keys().all(|&k| k > pivot));

        let mut rejoined = left;
        rejoined.join(right);
        rejoined.verify();
        prop_assert!(rejoined.keys().copied().eq(sorted.iter().copied()));
    }

    #[test]
    fn prop_split_at_exact(
        keys in prop::collection::vec(0u32..50, 0..300),
        k in 0usize..350,
    ) {
        let n = keys.len();
        let t = tree_of(&keys);
        let (left, right) = t.split_at(k);
        left.verify();
        right.verify();
        prop_assert_eq!(left.len(), k.min(n));
        prop_assert_eq!(right.len(), n - k.min(n));
        if let (Some((lmax, _)), Some((rmin, _))) = (left.last(), right.first()) {
            prop_assert!(lmax <= rmin);
        }
    }

    #[test]
    fn prop_rank_round_trip(keys in prop::collection::vec(0u32..1000, 1..300)) {
        let t = tree_of(&keys);
        for r in 0..t.len() {
            prop_assert_eq!(t.rank_of_cursor(t.find_rank(r)), r);
        }
        for &k in &keys {
            let (rank, cursor) = t.rank_of(&k);
            prop_assert_eq!(*t.entry(cursor).unwrap().0, k);
            prop_assert_eq!(t.rank_of_lower_bound(&k).0, rank);
        }
    }

    #[test]
    fn prop_leaf_iteration_is_sorted(keys in prop::collection::vec(0u32..100, 0..500)) {
        let t = tree_of(&keys);
        let collected: Vec<u32> = t.keys().copied().collect();
        prop_assert_eq!(collected.len(), keys.len());
        prop_assert!(collected.windows(2).all(|w| w[0] <= w[1]));
    }
}
