//! Opaque query resumption cursors.
//!
//! A native cursor is a self-delimiting blob: a varint column count and the
//! column descriptors up front, then the invertibly-encoded column values.
//! The blob is opaque to callers but round-trips, and its column set must
//! line up exactly with the query's effective sort order to be accepted.

use crate::error::{CursorKind, Error, Result};
use crate::index::{IndexColumn, KEY_PROP};
use crate::property::PropertyValue;
use crate::serialize;
use std::any::Any;
use std::fmt;

/// Callers hand cursors back as trait objects; only cursors minted by this
/// engine (`IndexCursor`) decode successfully.
pub trait Cursor: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCursor(pub Vec<u8>);

impl Cursor for IndexCursor {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn encode_columns(columns: &[IndexColumn]) -> Vec<u8> {
    let mut pre = Vec::new();
    serialize::write_uvarint(&mut pre, columns.len() as u64);
    for col in columns {
        pre.push(col.descending as u8);
        let mut w = serialize::Invertible::new();
        serialize::write_value(&mut w, &PropertyValue::Str(col.property.clone()));
        pre.extend_from_slice(w.as_slice());
    }
    pre
}

impl IndexCursor {
    /// Builds a cursor positioned at a row with the given column values.
    pub fn from_parts(columns: &[IndexColumn], values: &[PropertyValue]) -> Self {
        assert_eq!(columns.len(), values.len(), "column/value arity mismatch");
        let mut post = serialize::Invertible::new();
        for (col, value) in columns.iter().zip(values) {
            post.set_invert(col.descending);
            serialize::write_value(&mut post, value);
        }
        IndexCursor(serialize::join(&encode_columns(columns), post.as_slice()))
    }

    /// Builds a cursor from the already-encoded suffix bytes of an index
    /// row.
    pub(crate) fn from_suffix(columns: &[IndexColumn], suffix: &[u8]) -> Self {
        IndexCursor(serialize::join(&encode_columns(columns), suffix))
    }

    /// Splits the blob back into its column descriptors and the raw
    /// concatenated value bytes (still in per-column index direction).
    pub fn decode(&self) -> Result<(Vec<IndexColumn>, Vec<u8>)> {
        decode_blob(&self.0).map_err(|_| Error::InvalidCursor)
    }
}

fn decode_blob(blob: &[u8]) -> Result<(Vec<IndexColumn>, Vec<u8>)> {
    let (pre, post) = serialize::split_join(blob)?;
    let mut r = serialize::Reader::new(pre);
    let ncols = serialize::read_uvarint(&mut r)? as usize;
    if ncols == 0 {
        return Err(Error::InvalidCursor);
    }
    let mut columns = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        let descending = r.read_u8()? != 0;
        let property = match serialize::read_value(&mut r)? {
            PropertyValue::Str(s) => s,
            _ => return Err(Error::InvalidCursor),
        };
        columns.push(IndexColumn {
            property,
            descending,
        });
    }
    if r.remaining() != 0 {
        return Err(Error::InvalidCursor);
    }

    // The values must parse under the declared directions, and the cursor
    // must terminate with the key column.
    let mut vr = serialize::Reader::new(post);
    let mut last = None;
    for col in &columns {
        vr.set_invert(col.descending);
        last = Some(serialize::read_value(&mut vr)?);
    }
    if vr.remaining() != 0 {
        return Err(Error::InvalidCursor);
    }
    let ends_with_key = columns
        .last()
        .map(|c| c.property == KEY_PROP)
        .unwrap_or(false);
    if !ends_with_key || !matches!(last, Some(PropertyValue::Key(_))) {
        return Err(Error::InvalidCursor);
    }
    Ok((columns, post.to_vec()))
}

/// Validates a caller-supplied cursor against the reduced query's suffix
/// columns and returns the scan position directly after the row it names.
pub(crate) fn cursor_position(
    cursor: &dyn Cursor,
    which: CursorKind,
    suffix_format: &[IndexColumn],
) -> Result<Vec<u8>> {
    let native = cursor
        .as_any()
        .downcast_ref::<IndexCursor>()
        .ok_or(Error::BadCursorType)?;
    let (columns, mut bytes) = native.decode()?;
    if columns != suffix_format {
        return Err(Error::CursorMismatch(which));
    }
    // Positions are exclusive of the named row for starts and inclusive of
    // it for ends; appending a zero byte achieves both under the shared
    // [start, end) scan convention.
    bytes.push(0x00);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Key, KeyElem};

    fn key(id: i64) -> Key {
        Key::new("dev~app", "ns", vec![KeyElem::int("Something", id)])
    }

    fn cols() -> Vec<IndexColumn> {
        vec![IndexColumn::asc("Foo"), IndexColumn::asc(KEY_PROP)]
    }

    #[test]
    fn round_trips() {
        let c = IndexCursor::from_parts(
            &cols(),
            &[PropertyValue::Int(2), PropertyValue::Key(key(1))],
        );
        let (columns, bytes) = c.decode().unwrap();
        assert_eq!(columns, cols());
        let mut expect = serialize::to_bytes(&PropertyValue::Int(2));
        expect.extend_from_slice(&serialize::key_bytes(&key(1)));
        assert_eq!(bytes, expect);
    }

    #[test]
    fn empty_blob_is_invalid() {
        assert_eq!(
            IndexCursor(Vec::new()).decode().unwrap_err(),
            Error::InvalidCursor
        );
    }

    #[test]
    fn cursor_without_key_column_is_invalid() {
        let c = IndexCursor::from_parts(
            &[IndexColumn::asc("Foo")],
            &[PropertyValue::Int(100)],
        );
        assert_eq!(c.decode().unwrap_err(), Error::InvalidCursor);
    }

    #[test]
    fn foreign_cursor_type_is_rejected() {
        #[derive(Debug)]
        struct Silly;
        impl Cursor for Silly {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
        assert_eq!(
            cursor_position(&Silly, CursorKind::End, &cols()).unwrap_err(),
            Error::BadCursorType
        );
    }

    #[test]
    fn column_mismatch_names_the_cursor() {
        let c = IndexCursor::from_parts(
            &[IndexColumn::asc("Luci"), IndexColumn::asc(KEY_PROP)],
            &[PropertyValue::Int(100), PropertyValue::Key(key(1))],
        );
        let want = vec![
            IndexColumn::asc("Luci"),
            IndexColumn::asc("Charliene"),
            IndexColumn::asc(KEY_PROP),
        ];
        assert_eq!(
            cursor_position(&c, CursorKind::Start, &want).unwrap_err(),
            Error::CursorMismatch(CursorKind::Start)
        );
    }

    #[test]
    fn position_is_directly_after_the_row() {
        let c = IndexCursor::from_parts(
            &cols(),
            &[PropertyValue::Int(2), PropertyValue::Key(key(1))],
        );
        let pos = cursor_position(&c, CursorKind::Start, &cols()).unwrap();
        let (_, bytes) = c.decode().unwrap();
        assert!(pos > bytes);
        assert!(pos.starts_with(&bytes));
    }

    #[test]
    fn descending_columns_invert_values() {
        let cols = vec![IndexColumn::desc("Bar"), IndexColumn::asc(KEY_PROP)];
        let c = IndexCursor::from_parts(
            &cols,
            &[PropertyValue::Int(5), PropertyValue::Key(key(9))],
        );
        let (columns, bytes) = c.decode().unwrap();
        assert_eq!(columns, cols);
        assert!(bytes.starts_with(&serialize::to_bytes_dir(&PropertyValue::Int(5), true)));
    }
}
