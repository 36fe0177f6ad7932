#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use tether_core::{DynObject, Object, ObjectKey};
use tether_store::{store, IndexValues, Indexer, Indexers, Store, NAMESPACE_INDEX};

fn tiered(ns: &str, name: &str, rv: &str, tiers: &[&str]) -> DynObject {
    tiers.iter().fold(DynObject::new(Some(ns), name, rv), |o, t| o.with_label(&format!("tier/{}", t), "1"))
}

fn tier_index(o: &DynObject) -> IndexValues {
    o.labels.iter().filter_map(|(k, _)| k.strip_prefix("tier/")).map(str::to_string).collect()
}

/// Recompute every bucket from the stored objects and compare with the live index.
fn assert_consistent(s: &Store<DynObject>) {
    let indexes: [(&str, fn(&DynObject) -> IndexValues); 2] =
        [(NAMESPACE_INDEX, tether_store::namespace_index::<DynObject>), ("tier", tier_index)];
    for (name, f) in indexes {
        let mut expected: BTreeMap<String, BTreeSet<ObjectKey>> = BTreeMap::new();
        for o in s.list() {
            for v in f(&o) {
                expected.entry(v).or_default().insert(o.key());
            }
        }
        let values: BTreeSet<String> = s.list_index_values(name).into_iter().collect();
        assert_eq!(values, expected.keys().cloned().collect::<BTreeSet<_>>(), "index {} values", name);
        for (v, keys) in expected {
            let got: BTreeSet<ObjectKey> = s.index_keys(name, &v).unwrap().into_iter().collect();
            assert_eq!(got, keys, "index {} bucket {}", name, v);
        }
    }
}

#[test]
fn index_tracks_every_mutation() {
    let (mut w, s) = store(Indexers::namespaced().with("tier", tier_index));

    w.upsert(tiered("ns1", "a", "1", &["web"]));
    assert_consistent(&s);
    w.upsert(tiered("ns1", "b", "2", &["web", "db"]));
    assert_consistent(&s);
    // a switches tier, b loses one of two
    w.upsert(tiered("ns1", "a", "3", &["cache"]));
    assert_consistent(&s);
    w.upsert(tiered("ns1", "b", "4", &["db"]));
    assert_consistent(&s);
    assert!(s.index_keys("tier", "web").unwrap().is_empty());

    w.remove(&tiered("ns1", "a", "5", &[]));
    assert_consistent(&s);
    w.replace(vec![tiered("ns2", "c", "6", &["web"]), tiered("ns1", "b", "4", &["db"])]);
    assert_consistent(&s);
    assert_eq!(s.list_index_values(NAMESPACE_INDEX).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_never_see_partial_writes() {
    let (mut w, s) = store(Indexers::namespaced().with("tier", tier_index));
    let reader = s.clone();
    let check = tokio::spawn(async move {
        for _ in 0..500 {
            for o in reader.by_index("tier", "hot").unwrap() {
                assert!(tier_index(&o).iter().any(|t| t == "hot"), "{} filed under a stale bucket", o.key());
            }
            tokio::task::yield_now().await;
        }
    });
    for i in 0..500u32 {
        let tier = if i % 2 == 0 { "hot" } else { "cold" };
        w.upsert(tiered("ns", &format!("o{}", i % 7), &i.to_string(), &[tier]));
    }
    check.await.unwrap();
    assert_consistent(&s);
}
