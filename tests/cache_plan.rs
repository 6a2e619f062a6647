use entstore::cache::{self, CacheItem, FetchFacts, FlagValue};
use entstore::{Config, Datastore, Error, Key, KeyElem, Property, PropertyMap};
use rand::RngCore;
use std::ops::ControlFlow;

const NS: &str = "ns";

fn key(id: i64) -> Key {
    Key::new("dev~app", NS, vec![KeyElem::int("Kind", id)])
}

fn entity(val: i64) -> PropertyMap {
    let mut pm = PropertyMap::new();
    pm.set_one("val", Property::indexed(val));
    pm
}

fn nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 8];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn lock_item(flags: FlagValue, value: Vec<u8>) -> Option<CacheItem> {
    Some(CacheItem {
        key: "shard0".into(),
        flags: flags.flags(),
        value,
    })
}

#[test]
fn mixed_batch_splits_into_get_save_and_serve() {
    let our_nonce = nonce();
    let mut other_nonce = nonce();
    while other_nonce == our_nonce {
        other_nonce = nonce();
    }

    let keys: Vec<Key> = (0..4).map(key).collect();
    let items = vec![
        lock_item(FlagValue::Lock, our_nonce.clone()),
        lock_item(FlagValue::Data, cache::encode_item_value(&entity(42))),
        None,
        lock_item(FlagValue::Lock, other_nonce),
    ];
    let plan = cache::make_fetch_plan(&FetchFacts {
        get_keys: &keys,
        lock_items: &items,
        nonce: &our_nonce,
    });

    assert_eq!(plan.idx_map, vec![0, 2, 3]);
    assert_eq!(plan.to_get, vec![key(0), key(2), key(3)]);
    assert_eq!(plan.to_save.len(), 3);
    assert!(plan.to_save[0].is_some(), "we own the lock, so we save");
    assert!(plan.to_save[1].is_none(), "uncacheable entry never saves");
    assert!(plan.to_save[2].is_none(), "foreign lock never saves");
    assert_eq!(plan.decoded[1], Some(entity(42)));
    assert!(!plan.errs.any());
}

#[test]
fn fetch_plan_feeds_the_backing_store() {
    let ds = Datastore::new(Config::default());
    let keys: Vec<Key> = (0..2).map(key).collect();
    ds.put_multi(&keys, &[entity(1), entity(2)], |res| {
        res.expect("seed");
        ControlFlow::Continue(())
    })
    .unwrap();

    let our_nonce = nonce();
    // key 0 is served from cache, key 1 holds our lock
    let items = vec![
        lock_item(FlagValue::Data, cache::encode_item_value(&entity(1))),
        lock_item(FlagValue::Lock, our_nonce.clone()),
    ];
    let plan = cache::make_fetch_plan(&FetchFacts {
        get_keys: &keys,
        lock_items: &items,
        nonce: &our_nonce,
    });
    assert_eq!(plan.decoded[0], Some(entity(1)));
    assert_eq!(plan.to_get, vec![key(1)]);

    // fetch the remainder and produce the write-back payloads
    let mut fetched = Vec::new();
    ds.get_multi(&plan.to_get, |res| {
        fetched.push(res.expect("backing fetch"));
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(fetched, vec![entity(2)]);

    let save_value = cache::encode_item_value(&fetched[0]);
    assert_eq!(cache::decode_item_value(&save_value).unwrap(), entity(2));
    // caller index mapping lines the fetch back up with its slot
    assert_eq!(plan.idx_map, vec![1]);
}

#[test]
fn cached_miss_and_corruption_paths() {
    let keys: Vec<Key> = (0..2).map(key).collect();
    let our_nonce = nonce();
    let items = vec![
        lock_item(FlagValue::Data, Vec::new()),
        lock_item(FlagValue::Data, vec![0xFF, 0x00, 0x01]),
    ];
    let plan = cache::make_fetch_plan(&FetchFacts {
        get_keys: &keys,
        lock_items: &items,
        nonce: &our_nonce,
    });

    // empty data payload is the known-missing sentinel
    assert_eq!(plan.errs.get(0), Some(&Error::NoSuchEntity));
    assert!(plan.decoded[0].is_none());

    // corrupt payload falls back to fetch-without-save
    assert_eq!(plan.idx_map, vec![1]);
    assert!(plan.to_save[0].is_none());
    assert!(plan.errs.get(1).is_none());
}
