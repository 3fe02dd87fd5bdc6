use std::fmt::Debug;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::Result;
use crate::flight::Flight;
use crate::model::Model;
use crate::path;
use crate::path::Path;

/// Attribute mapping of a single record.
pub type Document = Map<String, Value>;

/// Name of the identifier attribute in persisted records.
pub const ID_FIELD: &str = "_id";

/// Equality filter over dotted attribute paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Document);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        let mut filter = Document::new();
        filter.insert(ID_FIELD.to_string(), Value::String(id.into()));
        Self(filter)
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(path.into(), value.into());
        self
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    /// The identifier this query pins down, if it is a plain by-id lookup.
    pub fn id(&self) -> Option<&str> {
        if self.0.len() == 1 {
            self.0.get(ID_FIELD).and_then(Value::as_str)
        }
        else {
            None
        }
    }

    pub fn matches(&self, record: &Document) -> Result<bool> {
        for (raw, expected) in &self.0 {
            let path = Path::parse(raw)?;
            if path::get(record, &path) != Some(expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl From<Document> for Query {
    fn from(filter: Document) -> Self {
        Self(filter)
    }
}

// A resolved model as kept in the cache, stamped with the version of the transition that put it there.
#[derive(Clone, Debug)]
pub(crate) struct Slot {
    pub(crate) version: u64,
    pub(crate) model:   Arc<Model>,
}

// An outstanding fetch of an identifier. Never kept in the cache itself: capacity or idle eviction must not lose
// track of it. `flight` identifies the fetch by the version it was launched with; `version` moves forward when an
// update or an eviction lands while the fetch is still out.
#[derive(Clone, Debug)]
pub(crate) struct Pending {
    pub(crate) flight:  Flight,
    pub(crate) version: u64,
}

impl Pending {
    pub(crate) fn is_stale(&self) -> bool {
        self.version != self.flight.id()
    }
}
