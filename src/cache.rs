//! Read-through cache fetch planning.
//!
//! Given the cache-lookup outcomes for a batch of keys, the planner
//! decides per key whether the cached entry serves the read, whether this
//! fetcher holds the lock and may write the fetched entity back, or
//! whether the entry must be fetched and bypassed. The backing-store fetch
//! itself happens elsewhere; this module only classifies.

use crate::error::{Error, Result};
use crate::key::Key;
use crate::property::PropertyMap;
use crate::serialize;
use tracing::warn;

/// Discriminator carried in a cache item's flags field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagValue {
    /// Unrecognized or never-written flags; treat the item as garbage.
    #[default]
    Unknown,
    /// The value is an encoded entity (empty value = known-missing).
    Data,
    /// The value is a fetcher's nonce claiming the fill lock.
    Lock,
}

impl FlagValue {
    pub fn from_flags(flags: u32) -> FlagValue {
        match flags {
            1 => FlagValue::Data,
            2 => FlagValue::Lock,
            _ => FlagValue::Unknown,
        }
    }

    pub fn flags(self) -> u32 {
        match self {
            FlagValue::Unknown => 0,
            FlagValue::Data => 1,
            FlagValue::Lock => 2,
        }
    }
}

/// One entry as returned by the external cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    pub flags: u32,
    pub value: Vec<u8>,
}

impl CacheItem {
    pub fn flag_value(&self) -> FlagValue {
        FlagValue::from_flags(self.flags)
    }
}

/// Everything the planner needs: the keys being fetched, the cache-lookup
/// outcome per key (`None` when the key was not cacheable at all), and the
/// nonce this fetcher wrote into any locks it owns.
pub struct FetchFacts<'a> {
    pub get_keys: &'a [Key],
    pub lock_items: &'a [Option<CacheItem>],
    pub nonce: &'a [u8],
}

/// Per-key error vector that only materializes once something fails.
#[derive(Debug, Default)]
pub struct LazyErrors {
    size: usize,
    inner: Option<Vec<Option<Error>>>,
}

impl LazyErrors {
    fn new(size: usize) -> Self {
        LazyErrors { size, inner: None }
    }

    fn assign(&mut self, i: usize, err: Error) {
        let size = self.size;
        self.inner.get_or_insert_with(|| vec![None; size])[i] = Some(err);
    }

    pub fn get(&self, i: usize) -> Option<&Error> {
        self.inner.as_ref().and_then(|v| v[i].as_ref())
    }

    pub fn any(&self) -> bool {
        self.inner.is_some()
    }
}

/// The classified batch. `to_get`, `idx_map` and `to_save` are aligned
/// with each other; `decoded` and the error vector are aligned with the
/// caller's original key list.
#[derive(Debug, Default)]
pub struct FetchPlan {
    /// Maps positions in `to_get` back to the caller's key indices.
    pub idx_map: Vec<usize>,
    /// Keys that still need a backing-store fetch.
    pub to_get: Vec<Key>,
    /// Cache items to write fetched data back into; `None` means the
    /// fetched entry must not be saved.
    pub to_save: Vec<Option<CacheItem>>,
    /// Entries already served from cache.
    pub decoded: Vec<Option<PropertyMap>>,
    pub errs: LazyErrors,
}

impl FetchPlan {
    fn add(&mut self, idx: usize, get: &Key, save: Option<CacheItem>) {
        self.idx_map.push(idx);
        self.to_get.push(get.clone());
        self.to_save.push(save);
    }

    /// True when every key was resolved from cache.
    pub fn empty(&self) -> bool {
        self.idx_map.is_empty()
    }
}

/// Payload codec for `Data` items: an empty value is the known-missing
/// sentinel, anything else is an encoded entity.
pub fn decode_item_value(value: &[u8]) -> Result<PropertyMap> {
    if value.is_empty() {
        return Err(Error::NoSuchEntity);
    }
    serialize::read_property_map(value)
}

pub fn encode_item_value(pm: &PropertyMap) -> Vec<u8> {
    serialize::to_entity_bytes(pm)
}

/// Classifies every key in `facts`:
///
/// - no cache item: fetch, don't save
/// - our lock: fetch and save back under the same item
/// - someone else's lock: fetch, don't save
/// - data: serve the decoded entity (or the known-missing sentinel); on a
///   decode failure, log and fall back to fetch-without-save
/// - anything else: fetch, don't save
pub fn make_fetch_plan(facts: &FetchFacts<'_>) -> FetchPlan {
    assert_eq!(
        facts.get_keys.len(),
        facts.lock_items.len(),
        "keys and lock items must align"
    );
    let mut plan = FetchPlan {
        decoded: vec![None; facts.get_keys.len()],
        errs: LazyErrors::new(facts.get_keys.len()),
        ..FetchPlan::default()
    };
    for (i, lock_item) in facts.lock_items.iter().enumerate() {
        let get_key = &facts.get_keys[i];

        let Some(item) = lock_item else {
            // not cacheable (caching disabled for the model, zero shards)
            plan.add(i, get_key, None);
            continue;
        };

        match item.flag_value() {
            FlagValue::Lock => {
                if item.value == facts.nonce {
                    // we hold the lock; fill the cache after fetching
                    plan.add(i, get_key, Some(item.clone()));
                } else {
                    plan.add(i, get_key, None);
                }
            }
            FlagValue::Data => match decode_item_value(&item.value) {
                Ok(pm) => plan.decoded[i] = Some(pm),
                Err(Error::NoSuchEntity) => plan.errs.assign(i, Error::NoSuchEntity),
                Err(err) => {
                    warn!(cache_key = %item.key, entity = %get_key, %err, "error decoding cache entry");
                    plan.add(i, get_key, None);
                }
            },
            FlagValue::Unknown => {
                // some other object, or the cache add failed for this item
                plan.add(i, get_key, None);
            }
        }
    }
    plan
}
