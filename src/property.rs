use crate::key::Key;
use compact_str::CompactString;
use std::collections::BTreeMap;

/// Tagged property value. Cross-type ordering is type-major following the
/// tag bytes assigned in `serialize`; within a type, the natural ordering
/// (floats use the IEEE754 total-order mapping).
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Null,
    Int(i64),
    /// Microseconds since the unix epoch.
    Time(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Str(CompactString),
    Float(f64),
    GeoPoint { lat: f64, lng: f64 },
    Key(Key),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Int(_) => "int",
            PropertyValue::Time(_) => "time",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Bytes(_) => "bytes",
            PropertyValue::Str(_) => "string",
            PropertyValue::Float(_) => "float",
            PropertyValue::GeoPoint { .. } => "geopoint",
            PropertyValue::Key(_) => "key",
        }
    }
}

// Floats compare by total-order bits so that values can live in ordered
// sets; this matches the index encoding exactly.
impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        use PropertyValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Int(a), Int(b)) => a == b,
            (Time(a), Time(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (
                GeoPoint { lat: a1, lng: o1 },
                GeoPoint { lat: a2, lng: o2 },
            ) => a1.to_bits() == a2.to_bits() && o1.to_bits() == o2.to_bits(),
            (Key(a), Key(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PropertyValue {}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.into())
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<Key> for PropertyValue {
    fn from(v: Key) -> Self {
        PropertyValue::Key(v)
    }
}

/// A value plus its indexability. Unindexed values round-trip through
/// entity bytes but never produce index rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub value: PropertyValue,
    pub indexed: bool,
}

impl Property {
    pub fn indexed(value: impl Into<PropertyValue>) -> Self {
        Property {
            value: value.into(),
            indexed: true,
        }
    }

    pub fn unindexed(value: impl Into<PropertyValue>) -> Self {
        Property {
            value: value.into(),
            indexed: false,
        }
    }
}

/// Reserved property carrying the monotonically increasing counter on
/// special entities (`__entity_group__` and friends).
pub const VERSION_PROP: &str = "__version__";

/// Multi-valued property map addressed by a `Key`. Iteration order is the
/// property-name order, which keeps index maintenance deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyMap(pub BTreeMap<CompactString, Vec<Property>>);

impl PropertyMap {
    pub fn new() -> Self {
        PropertyMap(BTreeMap::new())
    }

    pub fn set(&mut self, name: impl Into<CompactString>, props: Vec<Property>) {
        self.0.insert(name.into(), props);
    }

    /// Single-valued convenience setter.
    pub fn set_one(&mut self, name: impl Into<CompactString>, prop: Property) {
        self.0.insert(name.into(), vec![prop]);
    }

    pub fn get(&self, name: &str) -> Option<&[Property]> {
        self.0.get(name).map(|v| v.as_slice())
    }

    /// First value under `name`, if any.
    pub fn get_single(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name).and_then(|v| v.first()).map(|p| &p.value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CompactString, &Vec<Property>)> {
        self.0.iter()
    }

    /// The `__version__` counter, when present and well-formed.
    pub fn version(&self) -> Option<i64> {
        match self.get_single(VERSION_PROP) {
            Some(PropertyValue::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

/// True for `__name__`-shaped reserved property names.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with("__") && name.ends_with("__")
}
