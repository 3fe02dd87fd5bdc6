use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

use crate::op::UpdateDescriptor;
use crate::types::Document;
use crate::types::Query;

/// The durable side of a data collection.
///
/// Implementations talk to the document store. Records are [`Document`]s carrying their identifier under
/// [`ID_FIELD`](crate::types::ID_FIELD). The cache never inspects the store beyond these calls; in particular it
/// relies on `update` following the [operator semantics](crate::op) exactly, since the same descriptor is replayed
/// against the cached copy afterwards.
#[async_trait]
pub trait PersistenceAdapter: Debug + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn find_one(&self, query: &Query) -> Result<Option<Document>, Self::Error>;

    /// Records for the given identifiers, in any order. Identifiers with no record are simply not represented.
    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Document>, Self::Error>;

    async fn find(&self, query: &Query) -> Result<Vec<Document>, Self::Error>;

    /// Applies `update` to the record. Returns `false` if there is no such record.
    async fn update(&self, id: &str, update: &UpdateDescriptor) -> Result<bool, Self::Error>;

    /// Persists a new record and returns it as stored, with its identifier assigned.
    async fn create(&self, attributes: Document) -> Result<Document, Self::Error>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&self, id: &str) -> Result<bool, Self::Error>;
}

/// Hands out an adapter for every collection name a [`Registry`](crate::Registry) is asked about.
pub trait AdapterProvider: Send + Sync + 'static {
    type Adapter: PersistenceAdapter;

    fn adapter_for(&self, collection: &str) -> Arc<Self::Adapter>;
}
