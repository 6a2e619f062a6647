//! Query execution over store snapshots.
//!
//! The executor picks the index whose column prefix matches the reduced
//! query, scans `[start, end)` once per equality-value combination, and
//! k-way merges the streams in suffix order. Index rows come from the
//! (possibly lagging) index snapshot while entity data loads from the head
//! snapshot, which is what lets tests exercise read-after-write anomalies.

use crate::error::{Error, Result, corruption};
use crate::index::{
    IndexColumn, IndexDefinition, KEY_PROP, index_collection_name, registered_indexes,
};
use crate::key::Key;
use crate::property::{Property, PropertyMap, PropertyValue};
use crate::query::cursor::IndexCursor;
use crate::query::plan::FinalizedQuery;
use crate::query::reduce::{ReducedQuery, builtin_satisfiable, index_definition_for};
use crate::serialize;
use crate::store::Snapshot;
use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;

/// One result row. `data` is `None` for keys-only queries, the projection
/// tuple for projection queries, and the full entity otherwise.
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub key: Key,
    pub data: Option<PropertyMap>,
    suffix: Vec<u8>,
    columns: Vec<IndexColumn>,
}

impl QueryRow {
    /// A cursor that resumes the query directly after this row.
    pub fn cursor(&self) -> IndexCursor {
        IndexCursor::from_suffix(&self.columns, &self.suffix)
    }
}

enum Source {
    /// Scan the raw entity collection; rows are bare key encodings.
    Ents,
    Index(IndexDefinition),
}

fn pick_source(idx: &Snapshot, rq: &ReducedQuery) -> Result<Source> {
    if rq.kind.is_empty() {
        return Ok(Source::Ents);
    }
    let needed = index_definition_for(rq);
    if builtin_satisfiable(rq) {
        if needed.columns.is_empty() {
            return Ok(Source::Index(IndexDefinition::by_kind(rq.kind.clone())));
        }
        let col = &needed.columns[0];
        return Ok(Source::Index(IndexDefinition::by_property(
            rq.kind.clone(),
            &col.property,
            col.descending,
        )));
    }
    if registered_indexes(idx).contains(&needed) {
        return Ok(Source::Index(needed));
    }
    Err(Error::MissingIndex {
        ns: rq.ns.clone(),
        missing: Box::new(needed),
    })
}

/// `[lo, hi)` covering an ancestor's own key encoding plus every
/// descendant's. Key encodings end with the path terminator, and
/// descendants continue with the element marker just above it.
fn ancestor_range(anc: &Key) -> (Vec<u8>, Vec<u8>) {
    let lo = serialize::key_bytes(anc);
    let mut hi = lo.clone();
    let last = hi.last_mut().expect("key encodings are never empty");
    debug_assert_eq!(*last, 0x00);
    *last = 0x02;
    (lo, hi)
}

/// Equality-value combinations in index column order; the scan prefix per
/// stream. No equality filters yields the single empty prefix. Filters on
/// `__key__` never form prefix columns; they check residually against the
/// row's trailing key.
fn eq_prefixes(rq: &ReducedQuery) -> Vec<Vec<u8>> {
    let mut prefixes: Vec<Vec<u8>> = vec![Vec::new()];
    for (prop, values) in &rq.eq_filters {
        if prop == KEY_PROP {
            continue;
        }
        let mut next = Vec::with_capacity(prefixes.len() * values.len());
        for prefix in &prefixes {
            for value in values {
                let mut p = prefix.clone();
                p.extend_from_slice(value);
                next.push(p);
            }
        }
        prefixes = next;
    }
    prefixes
}

/// Runs the reduced query, invoking `cb` per row until the rows run out or
/// the callback breaks.
pub fn run_reduced<'a>(
    idx: &'a Snapshot,
    head: &'a Snapshot,
    fq: &FinalizedQuery,
    rq: &ReducedQuery,
    mut cb: impl FnMut(QueryRow) -> ControlFlow<()>,
) -> Result<()> {
    let source = pick_source(idx, rq)?;

    // Bare ascending key scans narrow to the ancestor's subtree directly;
    // everything else checks ancestry per row after decoding the key.
    let mut start = rq.start.clone();
    let mut end = rq.end.clone();
    if let Some(anc) = &rq.ancestor
        && rq.suffix_format.len() == 1
        && !rq.suffix_format[0].descending
    {
        let (lo, hi) = ancestor_range(anc);
        if lo > start {
            start = lo;
        }
        if end.as_ref().is_none_or(|e| hi < *e) {
            end = Some(hi);
        }
    }

    let coll_name = match &source {
        Source::Ents => format!("ents:{}", rq.ns),
        Source::Index(def) => index_collection_name(&rq.ns, def),
    };
    let Some(coll) = idx.get_collection(&coll_name) else {
        return Ok(());
    };

    let prefixes = eq_prefixes(rq);
    let mut streams: Vec<(usize, std::iter::Peekable<Box<dyn Iterator<Item = &'a [u8]> + 'a>>)> =
        Vec::with_capacity(prefixes.len());
    for prefix in &prefixes {
        let mut scan_start = prefix.clone();
        scan_start.extend_from_slice(&start);
        let scan_end: Option<Vec<u8>> = match &end {
            Some(e) => {
                let mut b = prefix.clone();
                b.extend_from_slice(e);
                Some(b)
            }
            None if prefix.is_empty() => None,
            None => serialize::increment(prefix),
        };
        let iter: Box<dyn Iterator<Item = &'a [u8]> + 'a> = Box::new(
            coll.iter_range(&scan_start, scan_end.as_deref())
                .map(|(k, _)| k.as_slice()),
        );
        streams.push((prefix.len(), iter.peekable()));
    }

    let ents_name = format!("ents:{}", rq.ns);
    let ents = head.get_collection(&ents_name);
    let multi_eq: Vec<(&str, &BTreeSet<Vec<u8>>)> = rq
        .eq_filters
        .iter()
        .filter(|(prop, set)| prop.as_str() != KEY_PROP && set.len() > 1)
        .map(|(prop, set)| (prop.as_str(), set))
        .collect();
    let key_eq = rq.eq_filters.get(KEY_PROP);

    let mut seen_tuples: HashSet<Vec<u8>> = HashSet::new();
    let mut to_skip = fq.offset.unwrap_or(0);
    let mut remaining = fq.limit;

    loop {
        if remaining == Some(0) {
            return Ok(());
        }

        // Smallest suffix across the streams is the next row in sort order.
        let mut best: Option<&'a [u8]> = None;
        for (plen, stream) in &mut streams {
            if let Some(&row) = stream.peek() {
                let suffix = &row[*plen..];
                if best.is_none_or(|b| suffix < b) {
                    best = Some(suffix);
                }
            }
        }
        let Some(suffix) = best else {
            return Ok(());
        };
        // Advance every stream sitting on this suffix; identical suffixes
        // across streams are the same entity row.
        for (plen, stream) in &mut streams {
            if let Some(&row) = stream.peek()
                && &row[*plen..] == suffix
            {
                stream.next();
            }
        }

        let mut r = serialize::Reader::new(suffix);
        let mut values: Vec<PropertyValue> = Vec::with_capacity(rq.num_suffix_columns);
        for col in &rq.suffix_format {
            r.set_invert(col.descending);
            match serialize::read_value(&mut r) {
                Ok(v) => values.push(v),
                Err(e) => corruption!("undecodable index row in {coll_name}: {e}"),
            }
        }
        if r.remaining() != 0 {
            corruption!("trailing bytes in index row in {coll_name}");
        }
        let key = match values.last() {
            Some(PropertyValue::Key(k)) => k.clone(),
            _ => corruption!("index row in {coll_name} does not end in a key"),
        };

        if let Some(anc) = &rq.ancestor
            && !anc.same_or_ancestor_of(&key)
        {
            continue;
        }
        let kb = serialize::key_bytes(&key);
        // An equality filter on __key__ pins the key itself; a key is
        // single-valued, so multiple distinct values can never match.
        if let Some(set) = key_eq
            && !(set.len() == 1 && set.contains(&kb))
        {
            continue;
        }

        // The index snapshot may run ahead of or behind the entity data in
        // head; rows whose entity is gone are simply dropped.
        let Some(ents) = ents else {
            continue;
        };
        let Some(raw) = ents.get(&kb) else {
            continue;
        };
        let entity = match serialize::read_property_map(raw) {
            Ok(pm) => pm,
            Err(e) => corruption!("undecodable entity for {key}: {e}"),
        };

        // Residual equality: multi-valued filters require every value to
        // be present on the entity, not just the one the scan matched.
        let mut all_present = true;
        for (prop, required) in &multi_eq {
            let have: BTreeSet<Vec<u8>> = entity
                .get(prop)
                .unwrap_or(&[])
                .iter()
                .filter(|p| p.indexed)
                .map(|p| serialize::to_bytes(&p.value))
                .collect();
            if !required.is_subset(&have) {
                all_present = false;
                break;
            }
        }
        if !all_present {
            continue;
        }

        let data = if !fq.projections.is_empty() {
            let mut pm = PropertyMap::new();
            let mut tuple = Vec::new();
            for prop in &fq.projections {
                let pos = rq
                    .suffix_format
                    .iter()
                    .position(|c| c.property == *prop)
                    .expect("projected properties are always in the suffix");
                let value = values[pos].clone();
                if fq.distinct {
                    tuple.extend_from_slice(&serialize::to_bytes(&value));
                }
                pm.set_one(prop.clone(), Property::indexed(value));
            }
            if fq.distinct && !seen_tuples.insert(tuple) {
                continue;
            }
            Some(pm)
        } else if fq.keys_only {
            None
        } else {
            Some(entity)
        };

        if to_skip > 0 {
            to_skip -= 1;
            continue;
        }
        if let Some(n) = &mut remaining {
            *n -= 1;
        }

        let row = QueryRow {
            key,
            data,
            suffix: suffix.to_vec(),
            columns: rq.suffix_format.clone(),
        };
        if cb(row).is_break() {
            return Ok(());
        }
    }
}
