//! The datastore root: head store, eventually-consistent query snapshot,
//! and optimistic entity-group transactions.
//!
//! The head is guarded by one read-write lock. Writers mutate the head and
//! its indexes under the write lock; readers briefly take the read lock to
//! grab an O(1) snapshot and then work lock-free. Transactions shadow
//! their mutations per entity group and commit only if no touched group's
//! `__entity_group__` version moved since the transaction began.

use crate::config::Config;
use crate::error::{Error, Result, corruption};
use crate::index::{self, IndexDefinition};
use crate::key::{Key, KeyElem};
use crate::property::{Property, PropertyMap, VERSION_PROP};
use crate::query::executor::{QueryRow, run_reduced};
use crate::query::plan::FinalizedQuery;
use crate::query::reduce::reduce;
use crate::serialize;
use crate::store::{Bytes, MemCollection, MemStore, Snapshot};
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Cross-group transactions may touch up to this many entity groups.
const XG_EG_LIMIT: usize = 25;

fn ents_collection(ns: &str) -> String {
    format!("ents:{ns}")
}

/// `__entity_group__` row of `key`'s group; its `__version__` drives
/// commit conflict detection.
fn group_meta_key(key: &Key) -> Bytes {
    let root = key.root();
    let mut elems = root.elems().to_vec();
    elems.push(KeyElem::int("__entity_group__", 1));
    serialize::key_bytes(&Key::new("", "", elems))
}

/// `__entity_group_ids__` row: the per-group id allocation counter.
fn group_ids_key(key: &Key) -> Bytes {
    let root = key.root();
    let mut elems = root.elems().to_vec();
    elems.push(KeyElem::int("__entity_group_ids__", 1));
    serialize::key_bytes(&Key::new("", "", elems))
}

/// `__entity_root_ids__` row: the per-kind id counter for parentless keys.
fn root_ids_key(kind: &str) -> Bytes {
    serialize::key_bytes(&Key::new(
        "",
        "",
        vec![KeyElem::string("__entity_root_ids__", kind)],
    ))
}

/// Reads the `__version__` counter at `key`, or zero when the row has
/// never been written.
fn cur_version(ents: Option<&MemCollection>, key: &[u8]) -> i64 {
    let Some(raw) = ents.and_then(|c| c.get(key)) else {
        return 0;
    };
    let pm = match serialize::read_property_map(raw) {
        Ok(pm) => pm,
        Err(e) => corruption!("unreadable special entity: {e}"),
    };
    match pm.version() {
        Some(v) => v,
        None => corruption!("{VERSION_PROP} property missing or wrong: {pm:?}"),
    }
}

/// Bumps the counter at `key` by `amt`, returning the first allocated
/// value.
fn increment_locked(ents: &mut MemCollection, key: &[u8], amt: i64) -> i64 {
    if amt <= 0 {
        panic!("increment_locked called with bad amt: {amt}");
    }
    let ret = cur_version(Some(ents), key) + 1;
    let mut pm = PropertyMap::new();
    pm.set_one(VERSION_PROP, Property::unindexed(ret + amt - 1));
    ents.set(key.to_vec(), serialize::to_entity_bytes(&pm));
    ret
}

struct HeadState {
    head: MemStore,
    /// The lagging query snapshot; `None` means "always consistent".
    snap: Option<Snapshot>,
    txn_fake_retry: u32,
    auto_index: bool,
    disable_special_entities: bool,
}

/// Shared datastore root. Handles are cheap clones of one underlying
/// store.
#[derive(Clone)]
pub struct Datastore {
    data: Arc<DatastoreData>,
}

pub(crate) struct DatastoreData {
    app: CompactString,
    state: RwLock<HeadState>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Allow the transaction to span up to 25 entity groups.
    pub xg: bool,
}

impl Datastore {
    pub fn new(config: Config) -> Self {
        let head = MemStore::new();
        let snap = if config.consistent {
            None
        } else {
            Some(head.snapshot())
        };
        Datastore {
            data: Arc::new(DatastoreData {
                app: config.app_id,
                state: RwLock::new(HeadState {
                    head,
                    snap,
                    txn_fake_retry: config.txn_retry_count,
                    auto_index: config.auto_index,
                    disable_special_entities: config.disable_special_entities,
                }),
            }),
        }
    }

    pub fn app(&self) -> &str {
        &self.data.app
    }

    // ------------------------------------------------------------------
    // Consistency and tuning controls
    // ------------------------------------------------------------------

    pub fn set_transaction_retry_count(&self, count: u32) {
        self.data.state.write().txn_fake_retry = count;
    }

    /// `always == true` drops the lagging snapshot so every query reads a
    /// fresh head snapshot; `false` re-freezes the lag at the current
    /// head.
    pub fn set_consistent(&self, always: bool) {
        let mut state = self.data.state.write();
        if always {
            state.snap = None;
        } else {
            state.snap = Some(state.head.snapshot());
        }
    }

    pub fn set_auto_index(&self, enable: bool) {
        self.data.state.write().auto_index = enable;
    }

    /// Only the enable direction is supported; see the setter's upstream
    /// contract.
    pub fn set_disable_special_entities(&self, _enabled: bool) {
        self.data.state.write().disable_special_entities = true;
    }

    pub fn disable_special_entities(&self) -> bool {
        self.data.state.read().disable_special_entities
    }

    pub fn add_indexes(&self, defs: &[IndexDefinition]) -> Result<()> {
        let mut state = self.data.state.write();
        let app = self.data.app.clone();
        index::add_indexes(&mut state.head, &app, defs)
    }

    /// Freezes the current head.
    pub fn take_snapshot(&self) -> Snapshot {
        self.data.state.read().head.snapshot()
    }

    /// Pins the eventually-consistent query snapshot to `snap`; a no-op in
    /// always-consistent mode.
    pub fn set_snapshot(&self, snap: Snapshot) {
        let mut state = self.data.state.write();
        if state.snap.is_none() {
            return;
        }
        state.snap = Some(snap);
    }

    /// Advances the query snapshot to the current head; a no-op in
    /// always-consistent mode.
    pub fn catchup_indexes(&self) {
        let mut state = self.data.state.write();
        if state.snap.is_none() {
            return;
        }
        state.snap = Some(state.head.snapshot());
    }

    /// `(index snapshot, head snapshot)` pair for a query.
    pub fn get_query_snaps(&self, consistent: bool) -> (Snapshot, Snapshot) {
        let state = self.data.state.read();
        match &state.snap {
            None => {
                let snap = state.head.snapshot();
                (snap.clone(), snap)
            }
            Some(lagging) => {
                let head = state.head.snapshot();
                let idx = if consistent {
                    head.clone()
                } else {
                    lagging.clone()
                };
                (idx, head)
            }
        }
    }

    // ------------------------------------------------------------------
    // Entity operations
    // ------------------------------------------------------------------

    pub fn allocate_ids(&self, incomplete: &Key, n: i64) -> Result<i64> {
        incomplete.check_valid(true, false)?;
        if !incomplete.incomplete() {
            return Err(Error::InvalidKey);
        }
        let mut state = self.data.state.write();
        self.data.allocate_ids_locked(&mut state, incomplete, n)
    }

    /// Stores each `(key, value)` pair, assigning ids to incomplete keys.
    /// The callback observes the stored key or the per-item error, and may
    /// break to stop early.
    pub fn put_multi(
        &self,
        keys: &[Key],
        vals: &[PropertyMap],
        mut cb: impl FnMut(Result<Key>) -> ControlFlow<()>,
    ) -> Result<()> {
        assert_eq!(keys.len(), vals.len(), "keys and values must align");
        for (key, val) in keys.iter().zip(vals) {
            let result = (|| {
                key.check_valid(true, false)?;
                let mut state = self.data.state.write();
                self.data.put_one_locked(&mut state, key, val)
            })();
            if cb(result).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Reads each key from a fresh head snapshot. Missing entities surface
    /// per-item as `NoSuchEntity`.
    pub fn get_multi(
        &self,
        keys: &[Key],
        mut cb: impl FnMut(Result<PropertyMap>) -> ControlFlow<()>,
    ) -> Result<()> {
        let snap = self.take_snapshot();
        get_multi_inner(&snap, keys, &mut cb)
    }

    pub fn delete_multi(
        &self,
        keys: &[Key],
        mut cb: impl FnMut(Result<()>) -> ControlFlow<()>,
    ) -> Result<()> {
        for key in keys {
            let result = (|| {
                key.check_valid(false, false)?;
                let mut state = self.data.state.write();
                self.data.delete_one_locked(&mut state, key);
                Ok(())
            })();
            if cb(result).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Runs a finalized query in `ns`, streaming rows to `cb`. Ancestor
    /// queries are strongly consistent; everything else reads the lagging
    /// index snapshot. With auto-indexing enabled, a missing composite
    /// index is registered and the query re-runs once.
    pub fn run_query(
        &self,
        ns: &str,
        fq: &FinalizedQuery,
        mut cb: impl FnMut(QueryRow) -> ControlFlow<()>,
    ) -> Result<()> {
        fq.valid(&self.data.app, ns)?;
        let rq = reduce(fq, &self.data.app, ns, false)?;
        let consistent = fq.ancestor().is_some();
        let (idx, head) = self.get_query_snaps(consistent);
        match run_reduced(&idx, &head, fq, &rq, &mut cb) {
            Err(err) => {
                if !self.maybe_auto_index(&err)? {
                    return Err(err);
                }
                debug!(%ns, "auto-added missing index, re-running query");
                let (idx, head) = self.get_query_snaps(consistent);
                run_reduced(&idx, &head, fq, &rq, &mut cb)
            }
            ok => ok,
        }
    }

    /// Registers the proposed index from a missing-index error when
    /// auto-indexing is on. Returns whether the query should be retried.
    fn maybe_auto_index(&self, err: &Error) -> Result<bool> {
        let Error::MissingIndex { missing, .. } = err else {
            return Ok(false);
        };
        if !self.data.state.read().auto_index {
            return Ok(false);
        }
        self.add_indexes(std::slice::from_ref(missing.as_ref()))?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Runs `f` in an optimistic transaction, retrying commit conflicts up
    /// to the configured count before surfacing the conflict. Errors from
    /// `f` abort immediately without retrying.
    pub fn run_in_transaction(
        &self,
        options: TransactionOptions,
        mut f: impl FnMut(&Transaction) -> Result<()>,
    ) -> Result<()> {
        let attempts = self.data.state.read().txn_fake_retry + 1;
        for _ in 0..attempts {
            let txn = self.mk_txn(options);
            let outcome = f(&txn);
            txn.end();
            outcome?;
            let mut state = self.data.state.write();
            if self.data.can_apply_locked(&state, &txn) {
                self.data.apply_locked(&mut state, &txn);
                return Ok(());
            }
            debug!("transaction conflict, retrying");
        }
        Err(Error::Conflict)
    }

    fn mk_txn(&self, options: TransactionOptions) -> Transaction {
        Transaction {
            parent: Arc::clone(&self.data),
            is_xg: options.xg,
            closed: AtomicBool::new(false),
            snap: self.take_snapshot(),
            muts: Mutex::new(BTreeMap::new()),
        }
    }
}

fn get_multi_inner(
    snap: &Snapshot,
    keys: &[Key],
    cb: &mut impl FnMut(Result<PropertyMap>) -> ControlFlow<()>,
) -> Result<()> {
    for key in keys {
        let result = (|| {
            key.check_valid(false, true)?;
            let coll = snap
                .get_collection(&ents_collection(key.namespace()))
                .ok_or(Error::NoSuchEntity)?;
            let raw = coll
                .get(&serialize::key_bytes(key))
                .ok_or(Error::NoSuchEntity)?;
            match serialize::read_property_map(raw) {
                Ok(pm) => Ok(pm),
                Err(e) => corruption!("unreadable entity for {key}: {e}"),
            }
        })();
        if cb(result).is_break() {
            return Ok(());
        }
    }
    Ok(())
}

impl DatastoreData {
    fn allocate_ids_locked(
        &self,
        state: &mut HeadState,
        incomplete: &Key,
        n: i64,
    ) -> Result<i64> {
        if state.disable_special_entities {
            return Err(Error::SpecialEntitiesDisabled {
                op: "allocate_ids",
            });
        }
        let id_key = if incomplete.parent().is_none() {
            root_ids_key(incomplete.kind())
        } else {
            group_ids_key(incomplete)
        };
        let ents = state.head.mutable(&ents_collection(incomplete.namespace()));
        Ok(increment_locked(ents, &id_key, n))
    }

    fn fix_key_locked(&self, state: &mut HeadState, key: &Key) -> Result<Key> {
        if key.incomplete() {
            let id = self.allocate_ids_locked(state, key, 1)?;
            return Ok(key.with_id(id));
        }
        Ok(key.clone())
    }

    fn put_one_locked(
        &self,
        state: &mut HeadState,
        key: &Key,
        val: &PropertyMap,
    ) -> Result<Key> {
        let key = self.fix_key_locked(state, key)?;
        let coll_name = ents_collection(key.namespace());
        if !state.disable_special_entities {
            let meta = group_meta_key(&key);
            increment_locked(state.head.mutable(&coll_name), &meta, 1);
        }
        let kb = serialize::key_bytes(&key);
        let old_raw = state.head.mutable(&coll_name).get(&kb).cloned();
        let old_pm = match &old_raw {
            Some(raw) => match serialize::read_property_map(raw) {
                Ok(pm) => Some(pm),
                Err(e) => return Err(e),
            },
            None => None,
        };
        state
            .head
            .mutable(&coll_name)
            .set(kb, serialize::to_entity_bytes(val));
        index::update_indexes(&mut state.head, &key, old_pm.as_ref(), Some(val));
        Ok(key)
    }

    fn delete_one_locked(&self, state: &mut HeadState, key: &Key) {
        let coll_name = ents_collection(key.namespace());
        if state.head.get_collection(&coll_name).is_none() {
            // namespace has never been written; nothing to delete or bump
            return;
        }
        if !state.disable_special_entities {
            let meta = group_meta_key(key);
            increment_locked(state.head.mutable(&coll_name), &meta, 1);
        }
        let kb = serialize::key_bytes(key);
        let old_raw = state.head.mutable(&coll_name).get(&kb).cloned();
        if let Some(raw) = old_raw {
            let old_pm = match serialize::read_property_map(&raw) {
                Ok(pm) => pm,
                Err(e) => corruption!("unreadable entity being deleted at {key}: {e}"),
            };
            state.head.mutable(&coll_name).delete(&kb);
            index::update_indexes(&mut state.head, key, Some(&old_pm), None);
        }
    }

    /// A transaction may apply iff every dirtied group's metadata version
    /// in head still matches what the transaction's snapshot saw.
    fn can_apply_locked(&self, state: &HeadState, txn: &Transaction) -> bool {
        let muts = txn.muts.lock();
        for (root_bytes, muts_for_group) in muts.iter() {
            if muts_for_group.is_empty() {
                // read-only group
                continue;
            }
            let mut r = serialize::Reader::new(root_bytes);
            let root = match serialize::read_key(&mut r) {
                Ok(k) => k,
                Err(e) => corruption!("unreadable txn group root: {e}"),
            };
            let coll_name = ents_collection(root.namespace());
            let mkey = group_meta_key(&root);
            let v_head = cur_version(state.head.get_collection(&coll_name), &mkey);
            let v_snap = cur_version(txn.snap.get_collection(&coll_name), &mkey);
            if v_head != v_snap {
                return false;
            }
        }
        true
    }

    /// Replays the shadow mutations through the ordinary put/delete path,
    /// which also bumps group versions so concurrent transactions on the
    /// same groups fail their version checks.
    fn apply_locked(&self, state: &mut HeadState, txn: &Transaction) {
        let muts = txn.muts.lock();
        for muts_for_group in muts.values() {
            for m in muts_for_group {
                let outcome = match &m.data {
                    Some(pm) => self.put_one_locked(state, &m.key, pm).map(|_| ()),
                    None => {
                        self.delete_one_locked(state, &m.key);
                        Ok(())
                    }
                };
                if let Err(e) = outcome {
                    corruption!("transaction apply failed for {}: {e}", m.key);
                }
            }
        }
    }
}

struct TxnMutation {
    key: Key,
    /// `None` is a tombstone.
    data: Option<PropertyMap>,
}

/// A live transaction. Reads come from the snapshot taken at begin; writes
/// shadow into the per-group mutation log and apply atomically at commit.
pub struct Transaction {
    parent: Arc<DatastoreData>,
    is_xg: bool,
    closed: AtomicBool,
    snap: Snapshot,
    /// Entity-group root key bytes to the group's mutation list. An entry
    /// with no mutations marks a group that was only read.
    muts: Mutex<BTreeMap<Bytes, Vec<TxnMutation>>>,
}

impl Transaction {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TxnClosed);
        }
        Ok(())
    }

    fn end(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            panic!("cannot end transaction twice");
        }
    }

    /// Admits `key`'s entity group into the transaction, enforcing the
    /// 1-group (or 25-group cross-group) budget. With `get_only` the group
    /// is recorded without logging a mutation.
    fn write_mutation(&self, get_only: bool, key: &Key, data: Option<PropertyMap>) -> Result<()> {
        let root_bytes = serialize::key_bytes(&key.root());
        let mut muts = self.muts.lock();
        if !muts.contains_key(&root_bytes) {
            let limit = if self.is_xg { XG_EG_LIMIT } else { 1 };
            if muts.len() + 1 > limit {
                return Err(Error::TooManyEntityGroups { xg: self.is_xg });
            }
            muts.insert(root_bytes.clone(), Vec::new());
        }
        if !get_only {
            muts.get_mut(&root_bytes)
                .expect("group inserted above")
                .push(TxnMutation {
                    key: key.clone(),
                    data,
                });
        }
        Ok(())
    }

    /// Ids for incomplete keys are still allocated against head so the
    /// caller sees the final key immediately, but the entity write itself
    /// only shadows.
    pub fn put_multi(
        &self,
        keys: &[Key],
        vals: &[PropertyMap],
        mut cb: impl FnMut(Result<Key>) -> ControlFlow<()>,
    ) -> Result<()> {
        assert_eq!(keys.len(), vals.len(), "keys and values must align");
        for (key, val) in keys.iter().zip(vals) {
            let result = (|| {
                self.check_open()?;
                key.check_valid(true, false)?;
                let fixed = {
                    let mut state = self.parent.state.write();
                    self.parent.fix_key_locked(&mut state, key)?
                };
                self.write_mutation(false, &fixed, Some(val.clone()))?;
                Ok(fixed)
            })();
            if cb(result).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Reads from the transaction snapshot. Shadowed writes from this same
    /// transaction are not visible.
    pub fn get_multi(
        &self,
        keys: &[Key],
        mut cb: impl FnMut(Result<PropertyMap>) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_open()?;
        for key in keys {
            self.write_mutation(true, key, None)?;
        }
        get_multi_inner(&self.snap, keys, &mut cb)
    }

    pub fn delete_multi(
        &self,
        keys: &[Key],
        mut cb: impl FnMut(Result<()>) -> ControlFlow<()>,
    ) -> Result<()> {
        for key in keys {
            let result = (|| {
                self.check_open()?;
                key.check_valid(false, false)?;
                self.write_mutation(false, key, None)
            })();
            if cb(result).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Transactional queries must be ancestor queries and read the
    /// transaction's snapshot.
    pub fn run_query(
        &self,
        ns: &str,
        fq: &FinalizedQuery,
        mut cb: impl FnMut(QueryRow) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_open()?;
        fq.valid(&self.parent.app, ns)?;
        let rq = reduce(fq, &self.parent.app, ns, true)?;
        if let Some(anc) = fq.ancestor() {
            self.write_mutation(true, &anc.root(), None)?;
        }
        run_reduced(&self.snap, &self.snap, fq, &rq, &mut cb)
    }
}
