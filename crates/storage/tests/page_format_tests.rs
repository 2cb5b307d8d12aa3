//! Cross-format tests for the storage page codecs
//!
//! These exercise the bucket codec and the COW-AVL page together with
//! randomized inputs, checking the invariants the engine above relies on:
//!
//! 1. **Bucket order** - iteration equals the sorted input set
//! 2. **Bucket lookup** - every present key resolves, absent keys miss
//! 3. **AVL visibility** - a committed version is immutable forever
//! 4. **AVL reclamation** - clean touches nothing above the keep seqid

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use raleighsl_storage::bucket::{BucketBuilder, BucketPage};
use raleighsl_storage::Avl16Page;
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ============================================================================
// Bucket codec
// ============================================================================

proptest! {
    #[test]
    fn bucket_round_trip_random_keys(
        pairs in prop::collection::btree_map(
            prop::collection::vec(any::<u8>(), 1..24),
            prop::collection::vec(any::<u8>(), 0..32),
            1..60,
        )
    ) {
        let mut builder = BucketBuilder::new(16 << 10);
        for (k, v) in &pairs {
            builder.append(k, v).unwrap();
        }
        let page = builder.finish();
        let view = BucketPage::new(&page);

        prop_assert_eq!(view.count(), pairs.len());

        // iteration equals the sorted input
        let decoded: BTreeMap<Vec<u8>, Vec<u8>> = view
            .iter()
            .map(|item| {
                let value = page[item.value_off..item.value_off + item.value_len].to_vec();
                (item.key, value)
            })
            .collect();
        prop_assert_eq!(&decoded, &pairs);

        // every key resolves through binary search
        for (k, v) in &pairs {
            let (off, len) = view.lookup(k).expect("present key");
            prop_assert_eq!(&page[off..off + len], v.as_slice());
        }
    }

    #[test]
    fn bucket_absent_keys_miss(
        keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 1..8), 1..40),
        probe in prop::collection::vec(any::<u8>(), 1..8),
    ) {
        let mut builder = BucketBuilder::new(8 << 10);
        for k in &keys {
            builder.append(k, b"v").unwrap();
        }
        let page = builder.finish();
        let view = BucketPage::new(&page);

        prop_assert_eq!(view.lookup(&probe).is_some(), keys.contains(&probe));
    }
}

// ============================================================================
// COW-AVL page
// ============================================================================

fn key_cmp(node_key: &[u8], key: &[u8]) -> Ordering {
    node_key[..8].cmp(&key[..8])
}

#[test]
fn avl_committed_versions_stay_immutable_under_random_churn() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let (mut page, _) = Avl16Page::init(64 << 10, 8);

    // ten rounds of random inserts, remembering what each version held
    let mut live: Vec<u64> = Vec::new();
    let mut versions: Vec<(u64, Vec<u64>)> = Vec::new();

    for round in 0..10u64 {
        let mut keys: Vec<u64> = (round * 37..round * 37 + 25).collect();
        keys.shuffle(&mut rng);

        let mut txn = page.txn_open(0).unwrap();
        for k in &keys {
            page.txn_insert(&mut txn, key_cmp, &k.to_be_bytes()).unwrap();
        }
        page.txn_commit(&mut txn).unwrap();

        live.extend(&keys);
        versions.push((page.current_seqid(), live.clone()));
    }

    // every recorded version still answers exactly its snapshot
    for (seqid, snapshot) in &versions {
        let txn = page.txn_open(*seqid).unwrap();
        for k in snapshot {
            assert!(
                page.txn_lookup(&txn, key_cmp, &k.to_be_bytes()).is_some(),
                "seqid {seqid} lost key {k}"
            );
        }
        let absent = 1_000_000u64;
        assert!(page.txn_lookup(&txn, key_cmp, &absent.to_be_bytes()).is_none());
    }

    // reclaim the first half of history; the rest is untouched
    let keep = versions[4].0;
    page.clean(keep);
    for (seqid, snapshot) in &versions {
        let opened = page.txn_open(*seqid);
        if *seqid <= keep {
            assert!(opened.is_err(), "seqid {seqid} should be reclaimed");
        } else {
            let txn = opened.unwrap();
            for k in snapshot {
                assert!(
                    page.txn_lookup(&txn, key_cmp, &k.to_be_bytes()).is_some(),
                    "seqid {seqid} lost key {k} after clean"
                );
            }
        }
    }
}

#[test]
fn avl_interleaved_insert_remove_matches_model() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let (mut page, _) = Avl16Page::init(64 << 10, 8);
    let mut model: std::collections::BTreeSet<u64> = Default::default();

    for round in 0..20u64 {
        let mut txn = page.txn_open(0).unwrap();
        for _ in 0..10 {
            let k = rand::Rng::gen_range(&mut rng, 0..200u64);
            if model.contains(&k) {
                page.txn_remove(&mut txn, key_cmp, &k.to_be_bytes()).unwrap();
                model.remove(&k);
            } else {
                page.txn_insert(&mut txn, key_cmp, &k.to_be_bytes()).unwrap();
                model.insert(k);
            }
        }
        page.txn_commit(&mut txn).unwrap();
        page.clean_all();

        let txn = page.txn_open(0).unwrap();
        for k in 0..200u64 {
            assert_eq!(
                page.txn_lookup(&txn, key_cmp, &k.to_be_bytes()).is_some(),
                model.contains(&k),
                "round {round} key {k}"
            );
        }
    }
}
