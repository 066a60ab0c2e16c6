//! Hierarchical entity keys and their canonical string form.
//!
//! A key is a path of `(kind, id)` segments, root first. The string form is
//! what lands in the `$Key` column:
//!
//! ```text
//! Company,'acme'/Department,42/Employee,7
//! ```
//!
//! Integer ids are written bare, names are single-quoted. Kinds and names are
//! percent-encoded so the delimiters (`/`, `,`, `'`) never appear inside a
//! segment. An incomplete key (no id assigned yet) encodes its final segment
//! as id `0`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between path segments
pub const KEY_DELIMITER: char = '/';

/// Escape character of [`Key::ancestor_pattern`]
pub const LIKE_ESCAPE: char = '\\';

const SEGMENT_SEPARATOR: char = ',';

/// Identifier of the final path segment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Id {
    /// No identifier assigned yet
    Incomplete,
    /// Auto-assigned or explicit integer id (never zero)
    Int(i64),
    /// Explicit string name (never empty)
    Name(String),
}

/// Hierarchical entity key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key {
    kind: String,
    id: Id,
    parent: Option<Box<Key>>,
}

impl Key {
    /// Key with an integer id. Zero yields an incomplete key.
    pub fn id(kind: impl Into<String>, id: i64, parent: Option<Key>) -> Self {
        let id = if id == 0 { Id::Incomplete } else { Id::Int(id) };
        Self {
            kind: kind.into(),
            id,
            parent: parent.map(Box::new),
        }
    }

    /// Key with a string name. An empty name yields an incomplete key.
    pub fn name(kind: impl Into<String>, name: impl Into<String>, parent: Option<Key>) -> Self {
        let name = name.into();
        let id = if name.is_empty() {
            Id::Incomplete
        } else {
            Id::Name(name)
        };
        Self {
            kind: kind.into(),
            id,
            parent: parent.map(Box::new),
        }
    }

    /// Key with no identifier, to be completed on insert
    pub fn incomplete(kind: impl Into<String>, parent: Option<Key>) -> Self {
        Self {
            kind: kind.into(),
            id: Id::Incomplete,
            parent: parent.map(Box::new),
        }
    }

    /// New complete key with a freshly allocated id
    pub fn allocate(kind: impl Into<String>, parent: Option<Key>) -> Self {
        Self::id(kind, allocate_id(), parent)
    }

    /// Key used for a row on insert.
    ///
    /// A missing key gets a fresh id, an incomplete key keeps its kind and
    /// parent and gets a fresh id, a complete key is kept as-is.
    pub fn for_insert(kind: &str, existing: Option<&Key>) -> Self {
        match existing {
            None => Self::allocate(kind, None),
            Some(key) if key.is_incomplete() => Self {
                kind: key.kind.clone(),
                id: Id::Int(allocate_id()),
                parent: key.parent.clone(),
            },
            Some(key) => key.clone(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id_value(&self) -> &Id {
        &self.id
    }

    /// Integer id, if the key has one
    pub fn int_id(&self) -> Option<i64> {
        match self.id {
            Id::Int(id) => Some(id),
            _ => None,
        }
    }

    /// String name, if the key has one
    pub fn name_id(&self) -> Option<&str> {
        match &self.id {
            Id::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }

    /// True iff the final segment has no assigned identifier
    pub fn is_incomplete(&self) -> bool {
        self.id == Id::Incomplete
    }

    /// Number of segments in the path
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    /// True when `ancestor` is a strict prefix of this key's path
    pub fn has_prefix(&self, ancestor: &Key) -> bool {
        let mut current = self.parent();
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent();
        }
        false
    }

    /// `LIKE` pattern matching every key below this one.
    ///
    /// `\`, `%` and `_` in the encoded key are escaped with [`LIKE_ESCAPE`].
    pub fn ancestor_pattern(&self) -> String {
        let encoded = self.encode();
        let mut out = String::with_capacity(encoded.len() + 2);
        for c in encoded.chars() {
            if matches!(c, LIKE_ESCAPE | '%' | '_') {
                out.push(LIKE_ESCAPE);
            }
            out.push(c);
        }
        out.push(KEY_DELIMITER);
        out.push('%');
        out
    }

    /// Canonical string form
    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.write_path(&mut out);
        out
    }

    /// Parse a canonical string form
    pub fn decode(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(malformed(input, "empty key"));
        }

        let mut key: Option<Key> = None;
        for segment in input.split(KEY_DELIMITER) {
            let (kind, id) = segment
                .split_once(SEGMENT_SEPARATOR)
                .ok_or_else(|| malformed(input, "segment is missing the kind separator"))?;

            if kind.is_empty() {
                return Err(malformed(input, "empty kind"));
            }
            let kind = urlencoding::decode(kind)
                .map_err(|e| malformed(input, &e.to_string()))?
                .into_owned();

            let id = if let Some(quoted) = id.strip_prefix('\'') {
                let name = quoted
                    .strip_suffix('\'')
                    .ok_or_else(|| malformed(input, "unterminated name"))?;
                if name.is_empty() {
                    return Err(malformed(input, "empty name"));
                }
                Id::Name(
                    urlencoding::decode(name)
                        .map_err(|e| malformed(input, &e.to_string()))?
                        .into_owned(),
                )
            } else {
                match id.parse::<i64>() {
                    Ok(0) => Id::Incomplete,
                    Ok(n) => Id::Int(n),
                    Err(_) => return Err(malformed(input, "id is neither integer nor quoted name")),
                }
            };

            key = Some(Key {
                kind,
                id,
                parent: key.map(Box::new),
            });
        }

        key.ok_or_else(|| malformed(input, "empty key"))
    }

    fn write_path(&self, out: &mut String) {
        if let Some(parent) = &self.parent {
            parent.write_path(out);
            out.push(KEY_DELIMITER);
        }
        out.push_str(&urlencoding::encode(&self.kind));
        out.push(SEGMENT_SEPARATOR);
        match &self.id {
            Id::Incomplete => out.push('0'),
            Id::Int(id) => out.push_str(&id.to_string()),
            Id::Name(name) => {
                out.push('\'');
                out.push_str(&urlencoding::encode(name));
                out.push('\'');
            }
        }
    }
}

fn malformed(input: &str, reason: &str) -> Error {
    Error::MalformedKey {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

/// Random positive 63-bit id
fn allocate_id() -> i64 {
    loop {
        let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
        let id = (high >> 1) as i64;
        if id != 0 {
            return id;
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for Key {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_nested_key() {
        let company = Key::name("Company", "acme", None);
        let dept = Key::id("Department", 42, Some(company));
        let emp = Key::id("Employee", 7, Some(dept));

        assert_eq!(emp.encode(), "Company,'acme'/Department,42/Employee,7");
        assert_eq!(emp.depth(), 3);
    }

    #[test]
    fn test_names_are_escaped() {
        let key = Key::name("User", "a/b,c'd", None);
        let encoded = key.encode();

        assert!(!encoded.contains("a/b"));
        assert_eq!(Key::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn test_incomplete_key() {
        let key = Key::incomplete("User", None);
        assert!(key.is_incomplete());
        assert_eq!(key.encode(), "User,0");
        assert!(Key::decode("User,0").unwrap().is_incomplete());
        assert!(Key::id("User", 0, None).is_incomplete());
        assert!(Key::name("User", "", None).is_incomplete());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        for input in ["", "User", ",1", "User,abc", "User,'open", "User,''", "A,1//B,2"] {
            assert!(
                matches!(Key::decode(input), Err(Error::MalformedKey { .. })),
                "accepted {:?}",
                input
            );
        }
    }

    #[test]
    fn test_has_prefix() {
        let root = Key::id("Root", 1, None);
        let child = Key::id("Child", 2, Some(root.clone()));
        let grandchild = Key::name("Leaf", "x", Some(child.clone()));

        assert!(grandchild.has_prefix(&root));
        assert!(grandchild.has_prefix(&child));
        assert!(!root.has_prefix(&root));
        assert!(!child.has_prefix(&grandchild));
    }

    #[test]
    fn test_ancestor_pattern() {
        let root = Key::id("Root", 1, None);
        assert_eq!(root.ancestor_pattern(), "Root,1/%");

        let child = Key::id("Child", 2, Some(root.clone()));
        assert!(child.encode().starts_with(&root.ancestor_pattern().replace('%', "")));
    }

    #[test]
    fn test_ancestor_pattern_escapes_wildcards() {
        let key = Key::name("Org", "a_b c", None);
        assert_eq!(key.encode(), "Org,'a_b%20c'");
        assert_eq!(key.ancestor_pattern(), "Org,'a\\_b\\%20c'/%");

        let key = Key::name("My_Kind", "x", None);
        assert_eq!(key.ancestor_pattern(), "My\\_Kind,'x'/%");
    }

    #[test]
    fn test_for_insert() {
        let fresh = Key::for_insert("User", None);
        assert_eq!(fresh.kind(), "User");
        assert!(!fresh.is_incomplete());

        let parent = Key::id("Org", 9, None);
        let filled = Key::for_insert("User", Some(&Key::incomplete("User", Some(parent.clone()))));
        assert_eq!(filled.parent(), Some(&parent));
        assert!(!filled.is_incomplete());

        let kept = Key::name("User", "bob", None);
        assert_eq!(Key::for_insert("User", Some(&kept)), kept);
    }

    #[test]
    fn test_serde_as_string() {
        let key = Key::id("Child", 2, Some(Key::name("Root", "r", None)));
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"Root,'r'/Child,2\"");
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    fn arb_segment() -> impl Strategy<Value = (String, Option<i64>, Option<String>)> {
        (
            "[A-Za-z][A-Za-z0-9_ ]{0,12}",
            prop::option::of(any::<i64>().prop_filter("non-zero", |n| *n != 0)),
            prop::option::of("\\PC{1,16}"),
        )
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(segments in prop::collection::vec(arb_segment(), 1..5)) {
            let mut key: Option<Key> = None;
            for (kind, id, name) in segments {
                key = Some(match (id, name) {
                    (Some(id), _) => Key::id(kind, id, key),
                    (None, Some(name)) => Key::name(kind, name, key),
                    (None, None) => Key::incomplete(kind, key),
                });
            }
            let key = key.unwrap();
            prop_assert_eq!(Key::decode(&key.encode()).unwrap(), key);
        }
    }
}
