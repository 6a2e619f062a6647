//! Secondary index maintenance.
//!
//! Two built-in families always exist: by-kind and by-(kind, property) in
//! both directions. Composite definitions are registered in the `idx`
//! collection and backfilled from the live entity population. Index rows
//! are the invertibly-encoded column values followed by the entity key;
//! the stored value is empty.

use crate::error::{Error, Result};
use crate::key::Key;
use crate::property::PropertyMap;
use crate::serialize;
use crate::store::{Bytes, MemStore, StoreView};
use compact_str::CompactString;
use std::collections::BTreeSet;
use std::fmt;
use tracing::info;

pub const KEY_PROP: &str = "__key__";

/// Collection holding registered composite index definitions.
const IDX_COLLECTION: &str = "idx";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexColumn {
    pub property: CompactString,
    pub descending: bool,
}

impl IndexColumn {
    pub fn asc(property: impl Into<CompactString>) -> Self {
        IndexColumn {
            property: property.into(),
            descending: false,
        }
    }

    pub fn desc(property: impl Into<CompactString>) -> Self {
        IndexColumn {
            property: property.into(),
            descending: true,
        }
    }

    /// Parses the `"-prop"` order notation.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::query("empty order"));
        }
        if let Some(rest) = s.strip_prefix('-') {
            if rest.is_empty() {
                return Err(Error::query("empty order"));
            }
            return Ok(IndexColumn::desc(rest));
        }
        if s.starts_with('+') {
            return Err(Error::query(format!("invalid order: {s:?}")));
        }
        Ok(IndexColumn::asc(s))
    }
}

impl fmt::Display for IndexColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.property)
        } else {
            write!(f, "{}", self.property)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexDefinition {
    pub kind: CompactString,
    pub ancestor: bool,
    pub columns: Vec<IndexColumn>,
}

impl IndexDefinition {
    pub fn by_kind(kind: impl Into<CompactString>) -> Self {
        IndexDefinition {
            kind: kind.into(),
            ancestor: false,
            columns: Vec::new(),
        }
    }

    pub fn by_property(kind: impl Into<CompactString>, prop: &str, descending: bool) -> Self {
        IndexDefinition {
            kind: kind.into(),
            ancestor: false,
            columns: vec![IndexColumn {
                property: prop.into(),
                descending,
            }],
        }
    }

    /// Built-in shapes never need registration: by-kind, or a single
    /// non-ancestor column.
    pub fn builtin(&self) -> bool {
        !self.ancestor && self.columns.len() <= 1
    }

    /// Stable identifier used in index row collection names.
    pub fn id(&self) -> String {
        let mut out = String::from(self.kind.as_str());
        if self.ancestor {
            out.push_str("|A");
        }
        for col in &self.columns {
            out.push('|');
            if col.descending {
                out.push('-');
            }
            out.push_str(&col.property);
        }
        out
    }

    /// Self-delimiting binary form, the registration key in `idx`.
    pub fn encode(&self) -> Bytes {
        let mut w = serialize::Invertible::new();
        serialize::write_value(&mut w, &crate::property::PropertyValue::Str(self.kind.clone()));
        let mut out = w.into_bytes();
        out.push(self.ancestor as u8);
        for col in &self.columns {
            out.push(0x01);
            out.push(col.descending as u8);
            let mut cw = serialize::Invertible::new();
            serialize::write_value(
                &mut cw,
                &crate::property::PropertyValue::Str(col.property.clone()),
            );
            out.extend_from_slice(cw.as_slice());
        }
        out.push(0x00);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = serialize::Reader::new(bytes);
        let kind = match serialize::read_value(&mut r)? {
            crate::property::PropertyValue::Str(s) => s,
            _ => return Err(Error::Decode("index definition kind".into())),
        };
        let ancestor = r.read_u8()? != 0;
        let mut columns = Vec::new();
        loop {
            match r.read_u8()? {
                0x00 => break,
                0x01 => {
                    let descending = r.read_u8()? != 0;
                    let property = match serialize::read_value(&mut r)? {
                        crate::property::PropertyValue::Str(s) => s,
                        _ => return Err(Error::Decode("index definition column".into())),
                    };
                    columns.push(IndexColumn {
                        property,
                        descending,
                    });
                }
                other => return Err(Error::Decode(format!("index definition marker {other:#x}"))),
            }
        }
        Ok(IndexDefinition {
            kind,
            ancestor,
            columns,
        })
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind={}", self.kind)?;
        if self.ancestor {
            write!(f, " ancestor")?;
        }
        for col in &self.columns {
            write!(f, " {col}")?;
        }
        Ok(())
    }
}

/// Name of the collection holding `def`'s rows in `ns`.
pub fn index_collection_name(ns: &str, def: &IndexDefinition) -> String {
    format!("idx:{ns}:{}", def.id())
}

/// Composite definitions currently registered, in registration-key order.
pub fn registered_indexes(view: &impl StoreView) -> Vec<IndexDefinition> {
    let Some(coll) = view.view_collection(IDX_COLLECTION) else {
        return Vec::new();
    };
    coll.iter()
        .filter_map(|(k, _)| IndexDefinition::decode(k).ok())
        .collect()
}

/// Rows `def` holds for the entity `(key, pm)`. Multi-valued properties
/// expand by cross product; only indexable values participate. An entity
/// missing any column property contributes no rows.
fn index_rows_for(def: &IndexDefinition, key: &Key, pm: &PropertyMap) -> BTreeSet<Bytes> {
    let key_bytes = serialize::key_bytes(key);
    let mut rows: BTreeSet<Bytes> = BTreeSet::new();
    if def.columns.is_empty() {
        rows.insert(key_bytes);
        return rows;
    }

    let mut per_column: Vec<Vec<Bytes>> = Vec::with_capacity(def.columns.len());
    for col in &def.columns {
        let encoded: Vec<Bytes> = if col.property == KEY_PROP {
            vec![serialize::to_bytes_dir(
                &crate::property::PropertyValue::Key(key.clone()),
                col.descending,
            )]
        } else {
            pm.get(&col.property)
                .unwrap_or(&[])
                .iter()
                .filter(|p| p.indexed)
                .map(|p| serialize::to_bytes_dir(&p.value, col.descending))
                .collect()
        };
        if encoded.is_empty() {
            return rows;
        }
        per_column.push(encoded);
    }

    let mut partials: Vec<Bytes> = vec![Vec::new()];
    for column_values in &per_column {
        let mut next = Vec::with_capacity(partials.len() * column_values.len());
        for partial in &partials {
            for value in column_values {
                let mut row = partial.clone();
                row.extend_from_slice(value);
                next.push(row);
            }
        }
        partials = next;
    }
    // Rows end with the entity key; a definition already closing with a
    // __key__ column carries it in that column instead.
    let key_terminated = def
        .columns
        .last()
        .is_some_and(|c| c.property == KEY_PROP);
    for mut row in partials {
        if !key_terminated {
            row.extend_from_slice(&key_bytes);
        }
        rows.insert(row);
    }
    rows
}

/// Every definition whose rows may involve this entity: built-ins for the
/// kind plus any union of old/new indexable properties, and registered
/// composites on the kind.
fn matching_definitions(
    head: &MemStore,
    kind: &str,
    old_pm: Option<&PropertyMap>,
    new_pm: Option<&PropertyMap>,
) -> Vec<IndexDefinition> {
    let mut defs = vec![IndexDefinition::by_kind(kind)];
    let mut props: BTreeSet<&CompactString> = BTreeSet::new();
    for pm in [old_pm, new_pm].into_iter().flatten() {
        for (name, values) in pm.iter() {
            if values.iter().any(|p| p.indexed) {
                props.insert(name);
            }
        }
    }
    for prop in props {
        defs.push(IndexDefinition::by_property(kind, prop, false));
        defs.push(IndexDefinition::by_property(kind, prop, true));
    }
    for def in registered_indexes(head) {
        if def.kind == kind {
            defs.push(def);
        }
    }
    defs
}

/// Applies the symmetric difference of index rows implied by an entity
/// mutation. `new_pm == None` is a delete.
pub fn update_indexes(
    head: &mut MemStore,
    key: &Key,
    old_pm: Option<&PropertyMap>,
    new_pm: Option<&PropertyMap>,
) {
    let ns = key.namespace().to_owned();
    let defs = matching_definitions(head, key.kind(), old_pm, new_pm);
    for def in defs {
        let old_rows = old_pm
            .map(|pm| index_rows_for(&def, key, pm))
            .unwrap_or_default();
        let new_rows = new_pm
            .map(|pm| index_rows_for(&def, key, pm))
            .unwrap_or_default();
        if old_rows == new_rows {
            continue;
        }
        let coll = head.mutable(&index_collection_name(&ns, &def));
        for row in old_rows.difference(&new_rows) {
            coll.delete(row);
        }
        for row in new_rows.difference(&old_rows) {
            coll.set(row.clone(), Vec::new());
        }
    }
}

/// Registers composite definitions and backfills their rows from the
/// current entity population of every namespace.
pub fn add_indexes(head: &mut MemStore, app: &str, defs: &[IndexDefinition]) -> Result<()> {
    let fresh: Vec<IndexDefinition> = {
        let existing = head.get_collection(IDX_COLLECTION);
        defs.iter()
            .filter(|d| {
                existing
                    .map(|coll| coll.get(&d.encode()).is_none())
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    };
    if fresh.is_empty() {
        return Ok(());
    }
    for def in &fresh {
        // __key__ is only meaningful as a final descending column; every
        // row already terminates with the ascending key.
        let bad_key_column = def.columns.iter().enumerate().any(|(i, c)| {
            c.property == KEY_PROP && (!c.descending || i != def.columns.len() - 1)
        });
        if bad_key_column {
            return Err(Error::query(format!(
                "composite index definitions may only use {KEY_PROP} as a final descending column: {def}"
            )));
        }
        head.mutable(IDX_COLLECTION).set(def.encode(), Vec::new());
    }

    // Backfill from every ents:<ns> collection.
    let ents_names: Vec<CompactString> = head
        .collection_names()
        .filter(|n| n.starts_with("ents:"))
        .cloned()
        .collect();
    let mut backfilled = 0usize;
    for coll_name in ents_names {
        let ns = coll_name.as_str()["ents:".len()..].to_owned();
        let entities: Vec<(Bytes, Bytes)> = head
            .get_collection(&coll_name)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        for (kbytes, vbytes) in entities {
            let mut r = serialize::Reader::new(&kbytes);
            let key = match serialize::read_key(&mut r) {
                Ok(k) => k,
                Err(_) => continue,
            };
            if key.app() != app {
                continue;
            }
            let pm = match serialize::read_property_map(&vbytes) {
                Ok(pm) => pm,
                Err(_) => continue,
            };
            for def in &fresh {
                if def.kind != key.kind() {
                    continue;
                }
                let rows = index_rows_for(def, &key, &pm);
                backfilled += rows.len();
                let coll = head.mutable(&index_collection_name(&ns, def));
                for row in rows {
                    coll.set(row, Vec::new());
                }
            }
        }
    }
    info!(
        added = fresh.len(),
        rows = backfilled,
        "registered composite indexes"
    );
    Ok(())
}
