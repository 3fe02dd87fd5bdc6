use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::op::UpdateDescriptor;
use crate::path;
use crate::path::Path;
use crate::types::Document;
use crate::types::ID_FIELD;

/// In-memory copy of one persisted record.
///
/// Models handed out by a [`DataCollection`](crate::DataCollection) are shared (`Arc<Model>`) and read-only. A changed
/// model is produced with [`Model::applied`], and only the collection decides whether it replaces the cached one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Model {
    id:         String,
    attributes: Document,
}

impl Model {
    pub fn new(id: impl Into<String>, mut attributes: Document) -> Self {
        attributes.remove(ID_FIELD);
        Self {
            id: id.into(),
            attributes,
        }
    }

    /// Builds a model out of a record returned by a persistence adapter.
    pub fn from_record(collection: &str, mut record: Document) -> Result<Self> {
        let id = match record.remove(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(other) => {
                return Err(Error::MalformedRecord {
                    collection: collection.to_string(),
                    reason:     format!("'{ID_FIELD}' must be a non-empty string, got {other}"),
                })
            }
            None => {
                return Err(Error::MalformedRecord {
                    collection: collection.to_string(),
                    reason:     format!("record has no '{ID_FIELD}'"),
                })
            }
        };
        Ok(Self { id, attributes: record })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attributes(&self) -> &Document {
        &self.attributes
    }

    /// Attribute at a dotted path. An unparsable path finds nothing.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if path == ID_FIELD {
            return None;
        }
        Path::parse(path).ok().and_then(|p| path::get(&self.attributes, &p))
    }

    pub fn to_record(&self) -> Document {
        let mut record = self.attributes.clone();
        record.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        record
    }

    /// A copy of this model with `update` applied. The model itself stays untouched, even when applying fails.
    pub fn applied(&self, update: &UpdateDescriptor) -> Result<Self> {
        let mut attributes = self.attributes.clone();
        update.apply(&mut attributes)?;
        Ok(Self {
            id: self.id.clone(),
            attributes,
        })
    }
}
