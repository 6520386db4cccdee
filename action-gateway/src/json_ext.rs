//! JSON helpers shared by the resolver, the guard cache and the batch coordinator.

use std::fmt;
use std::fmt::Write as _;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// A JSON value.
pub type Value = serde_json::Value;

/// A JSON object.
pub type Object = serde_json::Map<String, Value>;

/// A step in a [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index into an array.
    Index(usize),

    /// A key in an object.
    Key(String),
}

/// A path into a JSON value, or the response path of a GraphQL field.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parses a dotted path. Segments made of digits only become array indexes.
    pub fn from_dotted(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|segment| !segment.is_empty())
                .map(|segment| match segment.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(segment.to_string()),
                })
                .collect(),
        )
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self(vec![PathElement::Key(key.into())])
    }

    pub fn push_key(&mut self, key: impl Into<String>) {
        self.0.push(PathElement::Key(key.into()))
    }

    pub fn push_index(&mut self, index: usize) {
        self.0.push(PathElement::Index(index))
    }

    pub fn join(&self, key: impl Into<String>) -> Self {
        let mut path = self.clone();
        path.push_key(key);
        path
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char('.')?;
            }
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => f.write_str(key)?,
            }
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(path: &str) -> Self {
        Path::from_dotted(path)
    }
}

pub trait ValueExt {
    /// Returns the value found at `path`, if any.
    ///
    /// Array indexes also address object keys made of digits.
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value>;

    /// Recursively merges `lower` into `self`, keeping the keys of `self` on conflict.
    ///
    /// Only objects merge. When either side is not an object `self` is left untouched.
    fn merge_under(&mut self, lower: Value);

    /// True for keyed composite values (objects).
    fn is_composite(&self) -> bool;
}

impl ValueExt for Value {
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value> {
        let mut current = self;
        for element in path.iter() {
            current = match (element, current) {
                (PathElement::Key(key), Value::Object(object)) => object.get(key)?,
                (PathElement::Index(index), Value::Array(array)) => array.get(*index)?,
                (PathElement::Index(index), Value::Object(object)) => {
                    object.get(&index.to_string())?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    fn merge_under(&mut self, lower: Value) {
        if let (Value::Object(higher), Value::Object(lower)) = (self, lower) {
            for (key, value) in lower {
                match higher.get_mut(&key) {
                    Some(existing) => existing.merge_under(value),
                    None => {
                        higher.insert(key, value);
                    }
                }
            }
        }
    }

    fn is_composite(&self) -> bool {
        self.is_object()
    }
}

/// Serializes `value` as compact JSON with object keys sorted, so that two values that only
/// differ by key order produce the same text.
pub(crate) fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&object[key], out);
            }
            out.push('}');
        }
        Value::Array(array) => {
            out.push('[');
            for (i, item) in array.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex encoded SHA-256 of the canonical form of `value`.
pub(crate) fn fingerprint(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}
