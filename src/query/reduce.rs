//! Query reduction: from a `FinalizedQuery` to the byte-range scan plan
//! the executor runs.
//!
//! The reduced form carries the equality-filter map (encoded values), the
//! suffix columns that must be decoded per row for sorting and cursors,
//! and the inclusive-start / exclusive-end byte positions over that
//! suffix. Inequality bounds and cursors all collapse into those two
//! positions; a start at or past the end is a provably-empty query.

use crate::error::{CursorKind, Error, Result};
use crate::index::{IndexColumn, KEY_PROP};
use crate::key::Key;
use crate::query::cursor::cursor_position;
use crate::query::plan::{FinalizedQuery, adjusted_high, adjusted_low};
use crate::serialize;
use compact_str::CompactString;
use std::collections::{BTreeMap, BTreeSet};

/// Hard ceiling on filter values, sort columns and inequality endpoints.
const MAX_QUERY_COMPONENTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedQuery {
    pub app: CompactString,
    pub ns: CompactString,
    pub kind: CompactString,
    pub ancestor: Option<Key>,
    /// Property name to set of canonically-encoded equality values.
    pub eq_filters: BTreeMap<CompactString, BTreeSet<Vec<u8>>>,
    /// The ordered columns every row's suffix decodes under; always ends
    /// with `__key__`.
    pub suffix_format: Vec<IndexColumn>,
    /// Inclusive scan start over the suffix bytes; empty scans from the
    /// beginning.
    pub start: Vec<u8>,
    /// Exclusive scan end; `None` is unbounded.
    pub end: Option<Vec<u8>>,
    /// How many suffix columns the executor decodes per row.
    pub num_suffix_columns: usize,
}

/// Reduces `fq` for execution against `(app, ns)`. `in_txn` enforces the
/// ancestor requirement of transactional queries.
pub fn reduce(fq: &FinalizedQuery, app: &str, ns: &str, in_txn: bool) -> Result<ReducedQuery> {
    if in_txn && fq.ancestor.is_none() {
        return Err(Error::NoAncestor);
    }

    let mut eq_filters: BTreeMap<CompactString, BTreeSet<Vec<u8>>> = BTreeMap::new();
    for (prop, values) in &fq.eq_filters {
        let encoded: BTreeSet<Vec<u8>> = values.iter().map(serialize::to_bytes).collect();
        eq_filters.insert(prop.clone(), encoded);
    }

    let suffix_format = fq.orders.clone();

    let mut components = suffix_format.len();
    components += eq_filters.values().map(|s| s.len()).sum::<usize>();
    if let Some(ineq) = &fq.ineq {
        components += ineq.low.is_some() as usize + ineq.high.is_some() as usize;
    }
    if components > MAX_QUERY_COMPONENTS {
        return Err(Error::QueryTooLarge { components });
    }

    // Inequality bounds become byte positions on the first suffix column,
    // mapped through the column's direction.
    let mut start: Vec<u8> = Vec::new();
    let mut end: Option<Vec<u8>> = None;
    if let Some(ineq) = &fq.ineq {
        let first = suffix_format
            .first()
            .expect("normalized orders are never empty");
        debug_assert_eq!(first.property, ineq.prop);
        if !first.descending {
            if let Some(low) = &ineq.low {
                match adjusted_low(low) {
                    Some(bytes) => start = bytes,
                    None => return Err(Error::NullQuery),
                }
            }
            if let Some(high) = &ineq.high {
                end = adjusted_high(high);
            }
        } else {
            // Descending columns store complemented bytes, so the bounds
            // swap sides and invert.
            if let Some(high) = &ineq.high {
                let bytes = serialize::invert_bytes(&serialize::to_bytes(&high.value));
                if high.inclusive {
                    start = bytes;
                } else {
                    match serialize::increment(&bytes) {
                        Some(b) => start = b,
                        None => return Err(Error::NullQuery),
                    }
                }
            }
            if let Some(low) = &ineq.low {
                let bytes = serialize::invert_bytes(&serialize::to_bytes(&low.value));
                end = if low.inclusive {
                    serialize::increment(&bytes)
                } else {
                    Some(bytes)
                };
            }
        }
    }

    // Cursors clamp the scan window inward: the later start and the
    // earlier end win.
    if let Some(cursor) = &fq.start {
        let pos = cursor_position(cursor.as_ref(), CursorKind::Start, &suffix_format)?;
        if pos > start {
            start = pos;
        }
    }
    if let Some(cursor) = &fq.end {
        let pos = cursor_position(cursor.as_ref(), CursorKind::End, &suffix_format)?;
        if end.as_ref().is_none_or(|e| pos < *e) {
            end = Some(pos);
        }
    }

    if let Some(end_bytes) = &end
        && start.as_slice() >= end_bytes.as_slice()
    {
        return Err(Error::NullQuery);
    }

    let num_suffix_columns = suffix_format.len();
    Ok(ReducedQuery {
        app: app.into(),
        ns: ns.into(),
        kind: fq.kind.clone(),
        ancestor: fq.ancestor.clone(),
        eq_filters,
        suffix_format,
        start,
        end,
        num_suffix_columns,
    })
}

/// The composite definition that would make `rq` executable when built-ins
/// cannot: sorted equality properties, then the suffix columns. Equality
/// filters on `__key__` are served as a residual check, and the implicit
/// ascending `__key__` terminator is what every index row already ends
/// with, so neither becomes a column; a descending `__key__` sort does.
pub fn index_definition_for(rq: &ReducedQuery) -> crate::index::IndexDefinition {
    let mut columns: Vec<IndexColumn> = rq
        .eq_filters
        .keys()
        .filter(|prop| prop.as_str() != KEY_PROP)
        .map(|prop| IndexColumn::asc(prop.clone()))
        .collect();
    for col in &rq.suffix_format {
        if col.property != KEY_PROP || col.descending {
            columns.push(col.clone());
        }
    }
    crate::index::IndexDefinition {
        kind: rq.kind.clone(),
        ancestor: rq.ancestor.is_some(),
        columns,
    }
}

/// True when the plain built-in indexes can serve this shape: by-kind for
/// bare scans, by-property for a single constrained column. Anything wider
/// (or anything ancestor-scoped beyond a bare key scan, or a descending
/// key order) needs a composite.
pub fn builtin_satisfiable(rq: &ReducedQuery) -> bool {
    let def = index_definition_for(rq);
    def.columns.is_empty()
        || (!def.ancestor && def.columns.len() == 1 && def.columns[0].property != KEY_PROP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyElem;
    use crate::property::PropertyValue;
    use crate::query::cursor::IndexCursor;
    use crate::query::plan::Query;
    use std::sync::Arc;

    fn nq() -> Query {
        Query::new("Foo")
    }

    fn key(kind: &str, id: i64) -> Key {
        Key::new("dev~app", "ns", vec![KeyElem::int(kind, id)])
    }

    fn curs(prop: &str, v: i64, k: Key) -> Arc<IndexCursor> {
        Arc::new(IndexCursor::from_parts(
            &[IndexColumn::asc(prop), IndexColumn::asc(KEY_PROP)],
            &[PropertyValue::Int(v), PropertyValue::Key(k)],
        ))
    }

    #[test]
    fn non_ancestor_queries_in_a_transaction_are_rejected() {
        let fq = nq().finalize().unwrap();
        assert_eq!(
            reduce(&fq, "dev~app", "ns", true).unwrap_err(),
            Error::NoAncestor
        );
        let fq = nq().ancestor(key("thing", 1)).finalize().unwrap();
        assert!(reduce(&fq, "dev~app", "ns", true).is_ok());
    }

    #[test]
    fn absurd_numbers_of_filters_are_prohibited() {
        let mut q = nq().ancestor(key("thing", 1));
        for i in 0..100 {
            q = q.eq("something", i as i64);
        }
        let fq = q.finalize().unwrap();
        let err = reduce(&fq, "dev~app", "ns", false).unwrap_err();
        assert!(err.to_string().contains("query is too large"));
    }

    #[test]
    fn cursors_get_smooshed_into_the_inequality_range() {
        let fq = nq()
            .gt("Foo", 3i64)
            .lt("Foo", 10i64)
            .start(curs("Foo", 2, key("Something", 1)))
            .end(curs("Foo", 20, key("Something", 20)))
            .finalize()
            .unwrap();
        let rq = reduce(&fq, "dev~app", "ns", false).unwrap();
        assert_eq!(
            rq.suffix_format,
            vec![IndexColumn::asc("Foo"), IndexColumn::asc(KEY_PROP)]
        );
        assert_eq!(
            rq.start,
            serialize::increment(&serialize::to_bytes(&PropertyValue::Int(3))).unwrap()
        );
        assert_eq!(
            rq.end,
            Some(serialize::to_bytes(&PropertyValue::Int(10)))
        );
        assert_eq!(rq.num_suffix_columns, 2);
        assert!(rq.eq_filters.is_empty());
    }

    #[test]
    fn cursors_can_make_the_whole_query_useless() {
        let fq = nq()
            .gt("Foo", 3i64)
            .lt("Foo", 10i64)
            .start(curs("Foo", 200, key("Something", 1)))
            .end(curs("Foo", 1, key("Something", 20)))
            .finalize()
            .unwrap();
        assert_eq!(
            reduce(&fq, "dev~app", "ns", false).unwrap_err(),
            Error::NullQuery
        );
    }

    #[test]
    fn cursors_inside_the_range_clamp_the_scan() {
        let fq = nq()
            .gt("Foo", 3i64)
            .lt("Foo", 10i64)
            .start(curs("Foo", 5, key("Something", 1)))
            .finalize()
            .unwrap();
        let rq = reduce(&fq, "dev~app", "ns", false).unwrap();
        let mut expect = serialize::to_bytes(&PropertyValue::Int(5));
        expect.extend_from_slice(&serialize::key_bytes(&key("Something", 1)));
        expect.push(0x00);
        assert_eq!(rq.start, expect);
    }

    #[test]
    fn bad_cursor_column_sets_name_the_cursor() {
        let c = Arc::new(IndexCursor::from_parts(
            &[IndexColumn::asc("Luci"), IndexColumn::asc(KEY_PROP)],
            &[
                PropertyValue::Int(100),
                PropertyValue::Key(key("something", 1)),
            ],
        ));
        let fq = nq()
            .order("Luci")
            .order("Charliene")
            .start(c)
            .finalize()
            .unwrap();
        assert_eq!(
            reduce(&fq, "dev~app", "ns", false).unwrap_err(),
            Error::CursorMismatch(CursorKind::Start)
        );
    }

    #[test]
    fn empty_cursors_are_invalid() {
        let fq = nq()
            .start(Arc::new(IndexCursor(Vec::new())))
            .finalize()
            .unwrap();
        assert_eq!(
            reduce(&fq, "dev~app", "ns", false).unwrap_err(),
            Error::InvalidCursor
        );
    }

    #[test]
    fn descending_inequality_swaps_and_inverts_bounds() {
        let fq = nq()
            .gte("Foo", 3i64)
            .lt("Foo", 10i64)
            .order("-Foo")
            .finalize()
            .unwrap();
        let rq = reduce(&fq, "dev~app", "ns", false).unwrap();
        // start excludes 10 (exclusive high), end includes 3 (inclusive low)
        let inv10 = serialize::invert_bytes(&serialize::to_bytes(&PropertyValue::Int(10)));
        let inv3 = serialize::invert_bytes(&serialize::to_bytes(&PropertyValue::Int(3)));
        assert_eq!(rq.start, serialize::increment(&inv10).unwrap());
        assert_eq!(rq.end, Some(serialize::increment(&inv3).unwrap()));
    }

    #[test]
    fn missing_index_definition_shape() {
        let fq = nq()
            .eq("b", 1i64)
            .eq("a", 2i64)
            .gt("c", 0i64)
            .finalize()
            .unwrap();
        let rq = reduce(&fq, "dev~app", "ns", false).unwrap();
        let def = index_definition_for(&rq);
        assert_eq!(def.kind, "Foo");
        assert!(!def.ancestor);
        assert_eq!(
            def.columns,
            vec![
                IndexColumn::asc("a"),
                IndexColumn::asc("b"),
                IndexColumn::asc("c"),
            ]
        );
        assert!(!builtin_satisfiable(&rq));

        let fq = nq().eq("a", 1i64).finalize().unwrap();
        let rq = reduce(&fq, "dev~app", "ns", false).unwrap();
        assert!(builtin_satisfiable(&rq));

        let fq = nq().finalize().unwrap();
        let rq = reduce(&fq, "dev~app", "ns", false).unwrap();
        assert!(builtin_satisfiable(&rq));
    }
}
