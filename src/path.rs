//! Dotted attribute paths over nested documents.
//!
//! A path like `preferences.email.digest` addresses `digest` inside the `email` mapping inside the `preferences`
//! mapping. Only mappings are traversed; sequences and scalars are always leaves. When an intermediate node is not a
//! mapping, [`set`] fails with [`Error::TypeMismatch`] instead of overwriting it, [`get`] finds nothing, and [`unset`]
//! does nothing. The in-memory store and the cache mirror both go through this module, so they agree on every case.

use std::fmt::Display;
use std::str::FromStr;

use serde_json::Map;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::types::Document;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    raw:      String,
    segments: Vec<String>,
}

impl Path {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidOperator("empty attribute path".to_string()));
        }

        let segments = raw.split('.').map(str::to_string).collect::<Vec<_>>();
        if segments.iter().any(String::is_empty) {
            return Err(Error::InvalidOperator(format!("empty segment in attribute path '{raw}'")));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The first segment, i.e. the top-level attribute this path lives under.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    fn split_last(&self) -> (&[String], &str) {
        // Parsing never yields an empty segment list.
        match self.segments.split_last() {
            Some((last, parents)) => (parents, last.as_str()),
            None => (&[], self.raw.as_str()),
        }
    }

    // Prefix of the path made of the first `len` segments; used to point at the offending node in errors.
    fn prefix(&self, len: usize) -> String {
        self.segments[..len].join(".")
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Path {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Name of the JSON type of `value`, for error reporting.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn get<'a>(doc: &'a Document, path: &Path) -> Option<&'a Value> {
    let (parents, last) = path.split_last();
    let mut node = doc;
    for segment in parents {
        node = node.get(segment)?.as_object()?;
    }
    node.get(last)
}

pub fn get_mut<'a>(doc: &'a mut Document, path: &Path) -> Option<&'a mut Value> {
    let (parents, last) = path.split_last();
    let mut node = doc;
    for segment in parents {
        node = node.get_mut(segment)?.as_object_mut()?;
    }
    node.get_mut(last)
}

/// Assigns `value` at `path`, creating missing intermediate mappings. Returns the value previously stored there.
pub fn set(doc: &mut Document, path: &Path, value: Value) -> Result<Option<Value>> {
    let (parents, last) = path.split_last();
    let mut node = doc;
    for (depth, segment) in parents.iter().enumerate() {
        let child = node
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        let found = kind_of(child);
        node = child.as_object_mut().ok_or_else(|| Error::TypeMismatch {
            path: path.prefix(depth + 1),
            expected: "object",
            found,
        })?;
    }
    Ok(node.insert(last.to_string(), value))
}

/// Removes the attribute at `path`, returning it. Absent attributes and non-mapping intermediates are left alone.
pub fn unset(doc: &mut Document, path: &Path) -> Option<Value> {
    let (parents, last) = path.split_last();
    let mut node = doc;
    for segment in parents {
        node = node.get_mut(segment)?.as_object_mut()?;
    }
    node.remove(last)
}
