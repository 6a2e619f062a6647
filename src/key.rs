use crate::error::{Error, Result};
use compact_str::CompactString;

/// The identifier half of a key path element. Integer and string ids are
/// mutually exclusive; `Int(0)` marks the element (and therefore the key)
/// as incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElemId {
    Int(i64),
    Str(CompactString),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyElem {
    pub kind: CompactString,
    pub id: ElemId,
}

impl KeyElem {
    pub fn int(kind: impl Into<CompactString>, id: i64) -> Self {
        KeyElem {
            kind: kind.into(),
            id: ElemId::Int(id),
        }
    }

    pub fn string(kind: impl Into<CompactString>, id: impl Into<CompactString>) -> Self {
        KeyElem {
            kind: kind.into(),
            id: ElemId::Str(id.into()),
        }
    }

    pub fn incomplete(&self) -> bool {
        self.id == ElemId::Int(0)
    }
}

/// A fully-qualified entity key: application id, namespace, and a non-empty
/// path of `(kind, id)` elements. Total ordering is by serialized form (see
/// `serialize::key_bytes`), not by a derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    app: CompactString,
    namespace: CompactString,
    elems: Vec<KeyElem>,
}

impl Key {
    pub fn new(
        app: impl Into<CompactString>,
        namespace: impl Into<CompactString>,
        elems: Vec<KeyElem>,
    ) -> Self {
        Key {
            app: app.into(),
            namespace: namespace.into(),
            elems,
        }
    }

    /// Appends a child element to `parent`'s path.
    pub fn with_parent(parent: &Key, elem: KeyElem) -> Self {
        let mut elems = parent.elems.clone();
        elems.push(elem);
        Key {
            app: parent.app.clone(),
            namespace: parent.namespace.clone(),
            elems,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn elems(&self) -> &[KeyElem] {
        &self.elems
    }

    /// Kind of the last path element.
    pub fn kind(&self) -> &str {
        &self.last().kind
    }

    pub fn last(&self) -> &KeyElem {
        self.elems.last().expect("key path is never empty")
    }

    /// A key is incomplete when its final element has neither a string id
    /// nor a nonzero integer id.
    pub fn incomplete(&self) -> bool {
        self.last().incomplete()
    }

    pub fn parent(&self) -> Option<Key> {
        if self.elems.len() < 2 {
            return None;
        }
        Some(Key {
            app: self.app.clone(),
            namespace: self.namespace.clone(),
            elems: self.elems[..self.elems.len() - 1].to_vec(),
        })
    }

    /// The entity-group root: the one-element prefix of the path.
    pub fn root(&self) -> Key {
        Key {
            app: self.app.clone(),
            namespace: self.namespace.clone(),
            elems: self.elems[..1].to_vec(),
        }
    }

    /// Replaces the final element's id, completing an incomplete key.
    pub fn with_id(&self, id: i64) -> Key {
        let mut k = self.clone();
        k.elems.last_mut().expect("key path is never empty").id = ElemId::Int(id);
        k
    }

    /// Strict-prefix ancestry: `self` is an ancestor of `other` when they
    /// share app and namespace and `self`'s path is a proper prefix of
    /// `other`'s.
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        self.app == other.app
            && self.namespace == other.namespace
            && self.elems.len() < other.elems.len()
            && other.elems[..self.elems.len()] == self.elems[..]
    }

    /// Ancestor filters are inclusive of the ancestor itself.
    pub fn same_or_ancestor_of(&self, other: &Key) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Structural validity. Reserved (`__...__`) kinds are only legal when
    /// `allow_special` is set; incomplete keys only when `allow_incomplete`.
    pub fn valid(&self, allow_incomplete: bool, allow_special: bool) -> bool {
        if self.elems.is_empty() {
            return false;
        }
        for (i, elem) in self.elems.iter().enumerate() {
            if elem.kind.is_empty() || elem.kind.contains('\0') {
                return false;
            }
            if !allow_special && elem.kind.starts_with("__") && elem.kind.ends_with("__") {
                return false;
            }
            match &elem.id {
                ElemId::Str(s) => {
                    if s.is_empty() || s.contains('\0') {
                        return false;
                    }
                }
                ElemId::Int(n) => {
                    if *n < 0 {
                        return false;
                    }
                    if *n == 0 {
                        // Only the final element may be incomplete.
                        if !allow_incomplete || i != self.elems.len() - 1 {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    pub(crate) fn check_valid(&self, allow_incomplete: bool, allow_special: bool) -> Result<()> {
        if self.valid(allow_incomplete, allow_special) {
            Ok(())
        } else {
            Err(Error::InvalidKey)
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:", self.app, self.namespace)?;
        for elem in &self.elems {
            match &elem.id {
                ElemId::Int(n) => write!(f, "/{},{}", elem.kind, n)?,
                ElemId::Str(s) => write!(f, "/{},{:?}", elem.kind, s)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(elems: Vec<KeyElem>) -> Key {
        Key::new("dev~app", "ns", elems)
    }

    #[test]
    fn incomplete_detection() {
        assert!(key(vec![KeyElem::int("Kind", 0)]).incomplete());
        assert!(!key(vec![KeyElem::int("Kind", 1)]).incomplete());
        assert!(!key(vec![KeyElem::string("Kind", "name")]).incomplete());
    }

    #[test]
    fn ancestry_is_strict_prefix() {
        let root = key(vec![KeyElem::int("A", 1)]);
        let child = key(vec![KeyElem::int("A", 1), KeyElem::int("B", 2)]);
        assert!(root.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&root));
        assert!(!root.is_ancestor_of(&root));
        assert!(root.same_or_ancestor_of(&root));
        assert_eq!(child.root(), root);
        assert_eq!(child.parent().unwrap(), root);
    }

    #[test]
    fn cross_namespace_keys_are_unrelated() {
        let a = key(vec![KeyElem::int("A", 1)]);
        let b = Key::new("dev~app", "other", vec![KeyElem::int("A", 1), KeyElem::int("B", 2)]);
        assert!(!a.is_ancestor_of(&b));
    }

    #[test]
    fn validity_rules() {
        assert!(key(vec![KeyElem::int("A", 1)]).valid(false, false));
        assert!(!key(vec![KeyElem::int("A", 0)]).valid(false, false));
        assert!(key(vec![KeyElem::int("A", 0)]).valid(true, false));
        // interior incomplete element is never valid
        assert!(!key(vec![KeyElem::int("A", 0), KeyElem::int("B", 1)]).valid(true, false));
        assert!(!key(vec![KeyElem::int("", 1)]).valid(false, false));
        assert!(!key(vec![KeyElem::string("A", "")]).valid(false, false));
        assert!(!key(vec![KeyElem::int("__special__", 1)]).valid(false, false));
        assert!(key(vec![KeyElem::int("__special__", 1)]).valid(false, true));
        assert!(!key(vec![KeyElem::int("A", -5)]).valid(false, false));
    }
}
