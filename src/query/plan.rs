//! Query construction and finalization.
//!
//! `Query` is an immutable builder: every method returns a new value and
//! the first construction error sticks until `finalize()` reports it.
//! `FinalizedQuery` is the normalized snapshot the reducer consumes:
//! equality values deduplicated, redundant orders dropped, projections
//! folded into the order list, and the implicit trailing `__key__` order
//! appended.

use crate::error::{Error, Result};
use crate::index::{IndexColumn, KEY_PROP};
use crate::key::Key;
use crate::property::{PropertyValue, is_reserved_name};
use crate::query::cursor::Cursor;
use crate::serialize;
use compact_str::CompactString;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct BoundVal {
    pub value: PropertyValue,
    pub inclusive: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct IneqFilter {
    pub prop: CompactString,
    pub low: Option<BoundVal>,
    pub high: Option<BoundVal>,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    kind: CompactString,
    ancestor: Option<Key>,
    eq_filters: BTreeMap<CompactString, Vec<PropertyValue>>,
    ineq: Option<IneqFilter>,
    orders: Vec<IndexColumn>,
    projections: Vec<CompactString>,
    distinct: bool,
    keys_only: bool,
    limit: Option<i32>,
    offset: Option<i32>,
    start: Option<Arc<dyn Cursor>>,
    end: Option<Arc<dyn Cursor>>,
    err: Option<Error>,
}

impl Query {
    pub fn new(kind: impl Into<CompactString>) -> Self {
        Query {
            kind: kind.into(),
            ..Query::default()
        }
    }

    /// A query with no kind; limited to ancestor and `__key__` constraints.
    pub fn kindless() -> Self {
        Query::new("")
    }

    fn fail(mut self, err: Error) -> Self {
        if self.err.is_none() {
            self.err = Some(err);
        }
        self
    }

    fn check_filter_name(self, prop: &str) -> std::result::Result<Self, Self> {
        if self.err.is_some() {
            return Err(self);
        }
        if prop.is_empty() {
            return Err(self.fail(Error::query(format!("cannot filter/project on: {prop:?}"))));
        }
        if is_reserved_name(prop) && prop != KEY_PROP {
            return Err(self.fail(Error::query(format!(
                "cannot filter/project on reserved property: {prop:?}"
            ))));
        }
        Ok(self)
    }

    fn check_key_filter_value(self, prop: &str, value: &PropertyValue) -> std::result::Result<Self, Self> {
        if prop != KEY_PROP {
            return Ok(self);
        }
        match value {
            PropertyValue::Key(k) => {
                if !k.valid(false, false) {
                    Err(self.fail(Error::InvalidKey))
                } else {
                    Ok(self)
                }
            }
            _ => Err(self.fail(Error::query(format!(
                "filters on {KEY_PROP:?} must have type key"
            )))),
        }
    }

    /// Sets (or replaces) the ancestor. Ancestor filters are inclusive of
    /// the ancestor entity itself.
    pub fn ancestor(mut self, key: Key) -> Self {
        if self.err.is_some() {
            return self;
        }
        if !key.valid(false, false) {
            return self.fail(Error::InvalidKey);
        }
        self.ancestor = Some(key);
        self
    }

    /// Adds one equality filter value; call repeatedly for multiple values
    /// (all must be present on multi-valued properties).
    pub fn eq(self, prop: &str, value: impl Into<PropertyValue>) -> Self {
        let value = value.into();
        let this = match self.check_filter_name(prop) {
            Ok(q) => q,
            Err(q) => return q,
        };
        let mut this = match this.check_key_filter_value(prop, &value) {
            Ok(q) => q,
            Err(q) => return q,
        };
        this.eq_filters
            .entry(CompactString::from(prop))
            .or_default()
            .push(value);
        this
    }

    fn ineq(self, prop: &str, value: impl Into<PropertyValue>, low: bool, inclusive: bool) -> Self {
        let value = value.into();
        let this = match self.check_filter_name(prop) {
            Ok(q) => q,
            Err(q) => return q,
        };
        let mut this = match this.check_key_filter_value(prop, &value) {
            Ok(q) => q,
            Err(q) => return q,
        };
        let prop = CompactString::from(prop);
        let conflict = match &this.ineq {
            Some(f) if f.prop != prop => Some(f.prop.clone()),
            _ => None,
        };
        if let Some(first) = conflict {
            return this.fail(Error::MultipleInequality {
                first,
                second: prop,
            });
        }
        let bound = BoundVal { value, inclusive };
        if let Some(f) = this.ineq.as_mut() {
            let slot = if low { &mut f.low } else { &mut f.high };
            *slot = Some(match slot.take() {
                None => bound,
                Some(cur) => tighter(cur, bound, low),
            });
        } else {
            let bound = Some(bound);
            this.ineq = Some(IneqFilter {
                prop,
                low: if low { bound.clone() } else { None },
                high: if low { None } else { bound },
            });
        }
        this
    }

    pub fn gt(self, prop: &str, value: impl Into<PropertyValue>) -> Self {
        self.ineq(prop, value, true, false)
    }

    pub fn gte(self, prop: &str, value: impl Into<PropertyValue>) -> Self {
        self.ineq(prop, value, true, true)
    }

    pub fn lt(self, prop: &str, value: impl Into<PropertyValue>) -> Self {
        self.ineq(prop, value, false, false)
    }

    pub fn lte(self, prop: &str, value: impl Into<PropertyValue>) -> Self {
        self.ineq(prop, value, false, true)
    }

    /// Adds a sort order in the `"-prop"` notation.
    pub fn order(mut self, spec: &str) -> Self {
        if self.err.is_some() {
            return self;
        }
        match IndexColumn::parse(spec) {
            Ok(col) => {
                if is_reserved_name(&col.property) && col.property != KEY_PROP {
                    return self.fail(Error::query(format!(
                        "cannot sort on reserved property: {:?}",
                        col.property
                    )));
                }
                self.orders.push(col);
                self
            }
            Err(e) => self.fail(e),
        }
    }

    pub fn project(mut self, prop: &str) -> Self {
        if self.err.is_some() {
            return self;
        }
        if prop == KEY_PROP {
            return self.fail(Error::query(format!("cannot project on {KEY_PROP:?}")));
        }
        if prop.is_empty() {
            return self.fail(Error::query(format!("cannot filter/project on: {prop:?}")));
        }
        if is_reserved_name(prop) {
            return self.fail(Error::query(format!(
                "cannot filter/project on reserved property: {prop:?}"
            )));
        }
        self.projections.push(CompactString::from(prop));
        self
    }

    pub fn distinct(mut self, on: bool) -> Self {
        self.distinct = on;
        self
    }

    pub fn keys_only(mut self, on: bool) -> Self {
        self.keys_only = on;
        self
    }

    /// Negative values unset the limit.
    pub fn limit(mut self, n: i32) -> Self {
        self.limit = Some(n);
        self
    }

    /// Negative values unset the offset.
    pub fn offset(mut self, n: i32) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn start(mut self, cursor: Arc<dyn Cursor>) -> Self {
        self.start = Some(cursor);
        self
    }

    pub fn end(mut self, cursor: Arc<dyn Cursor>) -> Self {
        self.end = Some(cursor);
        self
    }

    /// Validates and normalizes into the immutable query snapshot.
    pub fn finalize(&self) -> Result<FinalizedQuery> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.keys_only && !self.projections.is_empty() {
            return Err(Error::query("cannot project a keysOnly query"));
        }

        if self.kind.is_empty() {
            if !self.eq_filters.is_empty() {
                return Err(Error::query(
                    "kindless queries may not have any equality filters",
                ));
            }
            if let Some(ineq) = &self.ineq
                && ineq.prop != KEY_PROP
            {
                return Err(Error::query(
                    "kindless queries can only filter on __key__",
                ));
            }
            let key_asc_only = self.orders.is_empty()
                || (self.orders.len() == 1 && self.orders[0] == IndexColumn::asc(KEY_PROP));
            if !key_asc_only {
                return Err(Error::query("invalid order for kindless query"));
            }
        }

        // Deduplicate equality values on their canonical encoding.
        let mut eq_filters: BTreeMap<CompactString, Vec<PropertyValue>> = BTreeMap::new();
        for (prop, values) in &self.eq_filters {
            let mut seen: BTreeMap<Vec<u8>, PropertyValue> = BTreeMap::new();
            for v in values {
                seen.entry(serialize::to_bytes(v)).or_insert_with(|| v.clone());
            }
            eq_filters.insert(prop.clone(), seen.into_values().collect());
        }

        let mut projections: Vec<CompactString> = self.projections.clone();
        projections.sort();
        projections.dedup();
        for prop in &projections {
            if eq_filters.contains_key(prop) {
                return Err(Error::query(format!(
                    "cannot project on equality filter field: {prop}"
                )));
            }
        }

        // Orders: drop equality-covered and duplicate columns, truncate at
        // __key__ (keys are unique, later columns can never influence the
        // ordering), fold the projections in, then close with the implicit
        // ascending __key__.
        let mut orders: Vec<IndexColumn> = Vec::new();
        for col in &self.orders {
            if col.property != KEY_PROP && eq_filters.contains_key(&col.property) {
                continue;
            }
            if orders.iter().any(|c| c.property == col.property) {
                continue;
            }
            let terminal = col.property == KEY_PROP;
            orders.push(col.clone());
            if terminal {
                break;
            }
        }
        if let Some(ineq) = &self.ineq {
            match orders.first() {
                Some(first) if first.property == ineq.prop => {}
                Some(_) => {
                    return Err(Error::IneqNotFirstSort {
                        prop: ineq.prop.clone(),
                    });
                }
                None => orders.push(IndexColumn::asc(ineq.prop.clone())),
            }
        }
        for prop in &projections {
            if !orders.iter().any(|c| &c.property == prop) {
                // keep __key__ terminal when it is already present
                let at = orders
                    .iter()
                    .position(|c| c.property == KEY_PROP)
                    .unwrap_or(orders.len());
                orders.insert(at, IndexColumn::asc(prop.clone()));
            }
        }
        if !orders.iter().any(|c| c.property == KEY_PROP) {
            orders.push(IndexColumn::asc(KEY_PROP));
        }

        if let Some(ineq) = &self.ineq {
            // Key bounds must live under the ancestor when one is set.
            if ineq.prop == KEY_PROP
                && let Some(anc) = &self.ancestor
            {
                for bound in [&ineq.low, &ineq.high].into_iter().flatten() {
                    if let PropertyValue::Key(k) = &bound.value
                        && !anc.same_or_ancestor_of(k)
                    {
                        return Err(Error::query(format!(
                            "inequality filters on {KEY_PROP} must be descendants of the __ancestor__",
                        )));
                    }
                }
            }
            // Impossible combined bounds make the query provably empty.
            if let (Some(low), Some(high)) = (&ineq.low, &ineq.high) {
                let low_bytes = adjusted_low(low);
                let high_bytes = adjusted_high(high);
                match (low_bytes, high_bytes) {
                    (Some(l), Some(h)) if l >= h => return Err(Error::NullQuery),
                    (None, _) => return Err(Error::NullQuery),
                    _ => {}
                }
            }
        }
        if let Some(anc) = &self.ancestor {
            for (prop, values) in &eq_filters {
                if prop != KEY_PROP {
                    continue;
                }
                for v in values {
                    if let PropertyValue::Key(k) = v
                        && !anc.same_or_ancestor_of(k)
                    {
                        return Err(Error::query(format!(
                            "{KEY_PROP} filters must be descendants of the __ancestor__",
                        )));
                    }
                }
            }
        }

        Ok(FinalizedQuery {
            kind: self.kind.clone(),
            ancestor: self.ancestor.clone(),
            eq_filters,
            ineq: self.ineq.clone(),
            orders,
            projections: projections.clone(),
            distinct: self.distinct && !projections.is_empty(),
            keys_only: self.keys_only,
            limit: self.limit.filter(|n| *n >= 0),
            offset: self.offset.filter(|n| *n >= 0),
            start: self.start.clone(),
            end: self.end.clone(),
        })
    }
}

/// Keeps the tighter of two bounds on the same side: the later start (or
/// earlier stop), with exclusivity winning ties.
fn tighter(cur: BoundVal, new: BoundVal, low: bool) -> BoundVal {
    let cur_bytes = serialize::to_bytes(&cur.value);
    let new_bytes = serialize::to_bytes(&new.value);
    if cur_bytes == new_bytes {
        return BoundVal {
            value: cur.value,
            inclusive: cur.inclusive && new.inclusive,
        };
    }
    let new_wins = if low {
        new_bytes > cur_bytes
    } else {
        new_bytes < cur_bytes
    };
    if new_wins { new } else { cur }
}

/// Inclusive-start byte form of a low bound; `None` means unsatisfiable.
pub(crate) fn adjusted_low(bound: &BoundVal) -> Option<Vec<u8>> {
    let bytes = serialize::to_bytes(&bound.value);
    if bound.inclusive {
        Some(bytes)
    } else {
        serialize::increment(&bytes)
    }
}

/// Exclusive-stop byte form of a high bound; `None` means unbounded.
pub(crate) fn adjusted_high(bound: &BoundVal) -> Option<Vec<u8>> {
    let bytes = serialize::to_bytes(&bound.value);
    if bound.inclusive {
        serialize::increment(&bytes)
    } else {
        Some(bytes)
    }
}

/// Immutable, normalized query; see the builder for the construction rules.
#[derive(Debug, Clone)]
pub struct FinalizedQuery {
    pub(crate) kind: CompactString,
    pub(crate) ancestor: Option<Key>,
    pub(crate) eq_filters: BTreeMap<CompactString, Vec<PropertyValue>>,
    pub(crate) ineq: Option<IneqFilter>,
    pub(crate) orders: Vec<IndexColumn>,
    pub(crate) projections: Vec<CompactString>,
    pub(crate) distinct: bool,
    pub(crate) keys_only: bool,
    pub(crate) limit: Option<i32>,
    pub(crate) offset: Option<i32>,
    pub(crate) start: Option<Arc<dyn Cursor>>,
    pub(crate) end: Option<Arc<dyn Cursor>>,
}

impl FinalizedQuery {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_kindless(&self) -> bool {
        self.kind.is_empty()
    }

    pub fn ancestor(&self) -> Option<&Key> {
        self.ancestor.as_ref()
    }

    /// Effective sort orders, always terminated by ascending `__key__`.
    pub fn orders(&self) -> &[IndexColumn] {
        &self.orders
    }

    pub fn projections(&self) -> &[CompactString] {
        &self.projections
    }

    pub fn keys_only(&self) -> bool {
        self.keys_only
    }

    /// Context re-validation: every key referenced by the query must live
    /// in the app and namespace the query runs against.
    pub fn valid(&self, app: &str, ns: &str) -> Result<()> {
        let check = |k: &Key| -> Result<()> {
            if k.app() != app || k.namespace() != ns {
                Err(Error::query(
                    "query filter key is in a different app or namespace than the query",
                ))
            } else {
                Ok(())
            }
        };
        if let Some(anc) = &self.ancestor {
            check(anc)?;
        }
        for values in self.eq_filters.values() {
            for v in values {
                if let PropertyValue::Key(k) = v {
                    check(k)?;
                }
            }
        }
        if let Some(ineq) = &self.ineq {
            for bound in [&ineq.low, &ineq.high].into_iter().flatten() {
                if let PropertyValue::Key(k) = &bound.value {
                    check(k)?;
                }
            }
        }
        Ok(())
    }
}
