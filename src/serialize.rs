//! Order-preserving byte encodings for property values, keys and entities.
//!
//! Every encoding here compares lexicographically the same way the decoded
//! values compare, which is what lets the executor run every query as a
//! byte-range scan. The `Invertible` writer emits bitwise complements for
//! descending index columns so those rows still sort correctly under
//! ascending comparison.

use crate::error::{Error, Result};
use crate::key::{ElemId, Key, KeyElem};
use crate::property::{Property, PropertyMap, PropertyValue};
use compact_str::CompactString;
use smallvec::SmallVec;

// Type tags, assigned in cross-type sort order. Gaps are deliberate.
const TAG_NULL: u8 = 0x01;
const TAG_INT: u8 = 0x10;
const TAG_TIME: u8 = 0x18;
const TAG_BOOL: u8 = 0x20;
const TAG_BYTES: u8 = 0x28;
const TAG_STR: u8 = 0x30;
const TAG_FLOAT: u8 = 0x38;
const TAG_GEOPOINT: u8 = 0x40;
const TAG_KEY: u8 = 0x48;

// Key path framing: each element is introduced by ELEM, the path ends with
// TERM. TERM < ELEM keeps every key sorted before its descendants.
const KEY_PATH_TERM: u8 = 0x00;
const KEY_PATH_ELEM: u8 = 0x01;

/// Byte writer that optionally complements everything written through it.
#[derive(Debug, Default)]
pub struct Invertible {
    buf: SmallVec<[u8; 64]>,
    invert: bool,
}

impl Invertible {
    pub fn new() -> Self {
        Invertible::default()
    }

    pub fn set_invert(&mut self, invert: bool) {
        self.invert = invert;
    }

    pub fn push(&mut self, b: u8) {
        self.buf.push(if self.invert { !b } else { b });
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.invert {
            self.buf.extend(bytes.iter().map(|b| !b));
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.into_vec()
    }
}

/// Byte reader matching `Invertible`: complements on the way out when
/// `invert` is set.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    invert: bool,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader {
            buf,
            pos: 0,
            invert: false,
        }
    }

    pub fn set_invert(&mut self, invert: bool) {
        self.invert = invert;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn fix(&self, b: u8) -> u8 {
        if self.invert { !b } else { b }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Decode("unexpected end of input".into()))?;
        self.pos += 1;
        Ok(self.fix(b))
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).map(|b| self.fix(*b))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(Error::Decode("unexpected end of input".into()));
        }
        let mut out = [0u8; N];
        for (i, b) in self.buf[self.pos..self.pos + N].iter().enumerate() {
            out[i] = self.fix(*b);
        }
        self.pos += N;
        Ok(out)
    }
}

fn flip_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

fn unflip_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ 0x8000_0000_0000_0000) as i64
}

// Total order preserving float mapping: negative floats complement, the
// rest flip the sign bit.
fn map_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let mapped = if (bits >> 63) == 1 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    };
    mapped.to_be_bytes()
}

fn unmap_f64(bytes: [u8; 8]) -> f64 {
    let mapped = u64::from_be_bytes(bytes);
    let bits = if (mapped >> 63) == 0 {
        !mapped
    } else {
        mapped ^ 0x8000_0000_0000_0000
    };
    f64::from_bits(bits)
}

// Strings and byte blobs: interior 0x00 escapes to 0x00 0xFF, a bare 0x00
// terminates. No value encoding ever starts with 0xFF, so the lookahead in
// `read_terminated` is unambiguous.
fn write_terminated(w: &mut Invertible, bytes: &[u8]) {
    for &b in bytes {
        if b == 0 {
            w.push(0x00);
            w.push(0xFF);
        } else {
            w.push(b);
        }
    }
    w.push(0x00);
}

fn read_terminated(r: &mut Reader<'_>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let b = r.read_u8()?;
        if b != 0 {
            out.push(b);
            continue;
        }
        if r.peek_u8() == Some(0xFF) {
            r.read_u8()?;
            out.push(0x00);
        } else {
            return Ok(out);
        }
    }
}

fn read_terminated_string(r: &mut Reader<'_>) -> Result<CompactString> {
    let raw = read_terminated(r)?;
    String::from_utf8(raw)
        .map(CompactString::from)
        .map_err(|_| Error::Decode("invalid utf-8 in encoded string".into()))
}

/// Writes `value` through `w`, honouring `w`'s invert setting.
pub fn write_value(w: &mut Invertible, value: &PropertyValue) {
    match value {
        PropertyValue::Null => w.push(TAG_NULL),
        PropertyValue::Int(v) => {
            w.push(TAG_INT);
            w.extend_from_slice(&flip_i64(*v));
        }
        PropertyValue::Time(v) => {
            w.push(TAG_TIME);
            w.extend_from_slice(&flip_i64(*v));
        }
        PropertyValue::Bool(v) => {
            w.push(TAG_BOOL);
            w.push(if *v { 1 } else { 0 });
        }
        PropertyValue::Bytes(v) => {
            w.push(TAG_BYTES);
            write_terminated(w, v);
        }
        PropertyValue::Str(v) => {
            w.push(TAG_STR);
            write_terminated(w, v.as_bytes());
        }
        PropertyValue::Float(v) => {
            w.push(TAG_FLOAT);
            w.extend_from_slice(&map_f64(*v));
        }
        PropertyValue::GeoPoint { lat, lng } => {
            w.push(TAG_GEOPOINT);
            w.extend_from_slice(&map_f64(*lat));
            w.extend_from_slice(&map_f64(*lng));
        }
        PropertyValue::Key(k) => {
            w.push(TAG_KEY);
            write_key_payload(w, k);
        }
    }
}

fn write_key_payload(w: &mut Invertible, key: &Key) {
    write_terminated(w, key.app().as_bytes());
    write_terminated(w, key.namespace().as_bytes());
    for elem in key.elems() {
        w.push(KEY_PATH_ELEM);
        write_terminated(w, elem.kind.as_bytes());
        match &elem.id {
            ElemId::Int(v) => {
                w.push(TAG_INT);
                w.extend_from_slice(&flip_i64(*v));
            }
            ElemId::Str(v) => {
                w.push(TAG_STR);
                write_terminated(w, v.as_bytes());
            }
        }
    }
    w.push(KEY_PATH_TERM);
}

fn read_key_payload(r: &mut Reader<'_>) -> Result<Key> {
    let app = read_terminated_string(r)?;
    let namespace = read_terminated_string(r)?;
    let mut elems = Vec::new();
    loop {
        match r.read_u8()? {
            KEY_PATH_TERM => break,
            KEY_PATH_ELEM => {
                let kind = read_terminated_string(r)?;
                let id = match r.read_u8()? {
                    TAG_INT => ElemId::Int(unflip_i64(r.read_array()?)),
                    TAG_STR => ElemId::Str(read_terminated_string(r)?),
                    other => {
                        return Err(Error::Decode(format!("bad key element id tag {other:#x}")));
                    }
                };
                elems.push(KeyElem { kind, id });
            }
            other => return Err(Error::Decode(format!("bad key path marker {other:#x}"))),
        }
    }
    if elems.is_empty() {
        return Err(Error::Decode("key with empty path".into()));
    }
    Ok(Key::new(app, namespace, elems))
}

/// Reads one value. The reader's invert flag must match how the value was
/// written.
pub fn read_value(r: &mut Reader<'_>) -> Result<PropertyValue> {
    let tag = r.read_u8()?;
    Ok(match tag {
        TAG_NULL => PropertyValue::Null,
        TAG_INT => PropertyValue::Int(unflip_i64(r.read_array()?)),
        TAG_TIME => PropertyValue::Time(unflip_i64(r.read_array()?)),
        TAG_BOOL => PropertyValue::Bool(r.read_u8()? != 0),
        TAG_BYTES => PropertyValue::Bytes(read_terminated(r)?),
        TAG_STR => PropertyValue::Str(read_terminated_string(r)?),
        TAG_FLOAT => PropertyValue::Float(unmap_f64(r.read_array()?)),
        TAG_GEOPOINT => PropertyValue::GeoPoint {
            lat: unmap_f64(r.read_array()?),
            lng: unmap_f64(r.read_array()?),
        },
        TAG_KEY => PropertyValue::Key(read_key_payload(r)?),
        other => return Err(Error::Decode(format!("bad value tag {other:#x}"))),
    })
}

/// Canonical ascending encoding of a single value.
pub fn to_bytes(value: &PropertyValue) -> Vec<u8> {
    let mut w = Invertible::new();
    write_value(&mut w, value);
    w.into_bytes()
}

/// Ascending or descending encoding, per `descending`.
pub fn to_bytes_dir(value: &PropertyValue, descending: bool) -> Vec<u8> {
    let mut w = Invertible::new();
    w.set_invert(descending);
    write_value(&mut w, value);
    w.into_bytes()
}

/// Keys are stored and referenced everywhere as their tagged property
/// encoding; app and namespace are part of it, so keys from different
/// namespaces can never collide.
pub fn key_bytes(key: &Key) -> Vec<u8> {
    to_bytes(&PropertyValue::Key(key.clone()))
}

pub fn read_key(r: &mut Reader<'_>) -> Result<Key> {
    match read_value(r)? {
        PropertyValue::Key(k) => Ok(k),
        other => Err(Error::Decode(format!(
            "expected a key, found {}",
            other.type_name()
        ))),
    }
}

// LEB128, used only for self-delimiting counts and frame lengths (never in
// ordered positions).
pub fn write_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn read_uvarint(r: &mut Reader<'_>) -> Result<u64> {
    let mut out = 0u64;
    let mut shift = 0u32;
    loop {
        let b = r.read_u8()?;
        if shift >= 64 || (shift == 63 && b > 1) {
            return Err(Error::Decode("uvarint overflow".into()));
        }
        out |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
    }
}

/// Serialized entity: varint property count, then per property its name,
/// and per value an index flag and the ascending value encoding. Also the
/// payload format for cached entity entries.
pub fn to_entity_bytes(pm: &PropertyMap) -> Vec<u8> {
    let mut out = Vec::new();
    write_uvarint(&mut out, pm.0.len() as u64);
    for (name, props) in pm.iter() {
        let mut w = Invertible::new();
        write_terminated(&mut w, name.as_bytes());
        out.extend_from_slice(w.as_slice());
        write_uvarint(&mut out, props.len() as u64);
        for prop in props {
            out.push(if prop.indexed { 1 } else { 0 });
            let mut vw = Invertible::new();
            write_value(&mut vw, &prop.value);
            out.extend_from_slice(vw.as_slice());
        }
    }
    out
}

pub fn read_property_map(bytes: &[u8]) -> Result<PropertyMap> {
    let mut r = Reader::new(bytes);
    let nprops = read_uvarint(&mut r)?;
    let mut pm = PropertyMap::new();
    for _ in 0..nprops {
        let name = read_terminated_string(&mut r)?;
        let nvals = read_uvarint(&mut r)?;
        let mut props = Vec::with_capacity(nvals as usize);
        for _ in 0..nvals {
            let indexed = r.read_u8()? != 0;
            let value = read_value(&mut r)?;
            props.push(Property { value, indexed });
        }
        pm.set(name, props);
    }
    if r.remaining() != 0 {
        return Err(Error::Decode("trailing bytes after entity".into()));
    }
    Ok(pm)
}

/// Length-prefixed concatenation; the prefix is self-delimiting on decode.
pub fn join(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + suffix.len() + 2);
    write_uvarint(&mut out, prefix.len() as u64);
    out.extend_from_slice(prefix);
    out.extend_from_slice(suffix);
    out
}

pub fn split_join(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut r = Reader::new(bytes);
    let plen = read_uvarint(&mut r)? as usize;
    let start = r.pos();
    if bytes.len() - start < plen {
        return Err(Error::Decode("joined frame truncated".into()));
    }
    Ok((&bytes[start..start + plen], &bytes[start + plen..]))
}

/// Big-endian increment with carry; the exclusive-bound form of an
/// inclusive one. `None` means overflow, i.e. "+infinity".
pub fn increment(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = bytes.to_vec();
    for i in (0..out.len()).rev() {
        if out[i] != 0xFF {
            out[i] += 1;
            return Some(out);
        }
        out[i] = 0x00;
    }
    None
}

/// Bitwise complement, for mapping ascending bounds into descending column
/// space.
pub fn invert_bytes(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| !b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyElem;
    use proptest::prelude::*;

    fn key(elems: Vec<KeyElem>) -> Key {
        Key::new("dev~app", "ns", elems)
    }

    #[test]
    fn int_order_is_preserved() {
        let a = to_bytes(&PropertyValue::Int(-10));
        let b = to_bytes(&PropertyValue::Int(0));
        let c = to_bytes(&PropertyValue::Int(42));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn cross_type_order_follows_tags() {
        let null = to_bytes(&PropertyValue::Null);
        let int = to_bytes(&PropertyValue::Int(i64::MIN));
        let boolean = to_bytes(&PropertyValue::Bool(false));
        let string = to_bytes(&PropertyValue::Str("".into()));
        let float = to_bytes(&PropertyValue::Float(f64::NEG_INFINITY));
        assert!(null < int);
        assert!(int < boolean);
        assert!(boolean < string);
        assert!(string < float);
    }

    #[test]
    fn string_null_escaping_keeps_order_and_round_trips() {
        let a = to_bytes(&PropertyValue::Str("a\0b".into()));
        let b = to_bytes(&PropertyValue::Str("a".into()));
        let c = to_bytes(&PropertyValue::Str("ab".into()));
        assert!(b < a);
        assert!(a < c);

        let mut r = Reader::new(&a);
        assert_eq!(
            read_value(&mut r).unwrap(),
            PropertyValue::Str("a\0b".into())
        );
    }

    #[test]
    fn descending_encoding_reverses_order() {
        let a = to_bytes_dir(&PropertyValue::Int(1), true);
        let b = to_bytes_dir(&PropertyValue::Int(2), true);
        assert!(b < a);

        let mut r = Reader::new(&a);
        r.set_invert(true);
        assert_eq!(read_value(&mut r).unwrap(), PropertyValue::Int(1));
    }

    #[test]
    fn ancestor_keys_sort_before_descendants() {
        let root = key(vec![KeyElem::int("A", 1)]);
        let child = Key::with_parent(&root, KeyElem::string("B", "x"));
        let sibling = key(vec![KeyElem::int("A", 2)]);
        let rb = key_bytes(&root);
        let cb = key_bytes(&child);
        let sb = key_bytes(&sibling);
        assert!(rb < cb);
        assert!(cb < sb);
    }

    #[test]
    fn int_ids_sort_before_string_ids() {
        let a = key_bytes(&key(vec![KeyElem::int("A", i64::MAX)]));
        let b = key_bytes(&key(vec![KeyElem::string("A", "0")]));
        assert!(a < b);
    }

    #[test]
    fn key_round_trip() {
        let k = key(vec![KeyElem::int("A", 7), KeyElem::string("B", "hi\0there")]);
        let bytes = key_bytes(&k);
        let mut r = Reader::new(&bytes);
        assert_eq!(read_key(&mut r).unwrap(), k);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn entity_round_trip() {
        let mut pm = PropertyMap::new();
        pm.set(
            "vals",
            vec![Property::indexed(10i64), Property::unindexed("s")],
        );
        pm.set_one("f", Property::indexed(2.5));
        pm.set_one(
            "k",
            Property::indexed(PropertyValue::Key(key(vec![KeyElem::int("A", 1)]))),
        );
        let bytes = to_entity_bytes(&pm);
        assert_eq!(read_property_map(&bytes).unwrap(), pm);
    }

    #[test]
    fn increment_carries_and_overflows() {
        assert_eq!(increment(&[0x10, 0xAA]).unwrap(), vec![0x10, 0xAB]);
        assert_eq!(increment(&[0x10, 0xFF]).unwrap(), vec![0x11, 0x00]);
        assert_eq!(increment(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn join_frames_are_self_delimiting() {
        let joined = join(b"abc", b"defg");
        let (pre, post) = split_join(&joined).unwrap();
        assert_eq!(pre, b"abc");
        assert_eq!(post, b"defg");
    }

    fn arb_value() -> impl Strategy<Value = PropertyValue> {
        prop_oneof![
            Just(PropertyValue::Null),
            any::<i64>().prop_map(PropertyValue::Int),
            any::<i64>().prop_map(PropertyValue::Time),
            any::<bool>().prop_map(PropertyValue::Bool),
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(PropertyValue::Bytes),
            "[a-z\\x00]{0,12}".prop_map(|s| PropertyValue::Str(s.into())),
            any::<f64>().prop_map(PropertyValue::Float),
        ]
    }

    fn value_cmp(a: &PropertyValue, b: &PropertyValue) -> std::cmp::Ordering {
        // the encoding is the definition of the ordering; compare through it
        to_bytes(a).cmp(&to_bytes(b))
    }

    proptest! {
        #[test]
        fn encoding_round_trips(v in arb_value()) {
            let bytes = to_bytes(&v);
            let mut r = Reader::new(&bytes);
            let back = read_value(&mut r).unwrap();
            prop_assert_eq!(r.remaining(), 0);
            prop_assert_eq!(back, v);
        }

        #[test]
        fn same_type_order_agrees_with_natural_order(a in any::<i64>(), b in any::<i64>()) {
            let ab = to_bytes(&PropertyValue::Int(a));
            let bb = to_bytes(&PropertyValue::Int(b));
            prop_assert_eq!(a.cmp(&b), ab.cmp(&bb));
        }

        #[test]
        fn float_order_agrees_on_non_nan(a in any::<f64>(), b in any::<f64>()) {
            prop_assume!(!a.is_nan() && !b.is_nan());
            if a < b {
                prop_assert_eq!(
                    value_cmp(&PropertyValue::Float(a), &PropertyValue::Float(b)),
                    std::cmp::Ordering::Less
                );
            }
        }

        #[test]
        fn descending_is_exact_reverse(a in arb_value(), b in arb_value()) {
            let asc = value_cmp(&a, &b);
            let desc = to_bytes_dir(&a, true).cmp(&to_bytes_dir(&b, true));
            prop_assert_eq!(asc, desc.reverse());
        }
    }
}
