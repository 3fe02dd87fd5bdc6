//! # dc-cache
//!
//! Write-through, in-process caching of document records for request-handling servers.
//!
//! Think of it as a per-process object cache sitting in front of a document store: handlers read models by
//! identifier, update them with atomic field operators, and the cache keeps its copies in step with the store without
//! re-reading records after every write.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Records are documents (JSON-like mappings) identified by a string `_id`.
//! - Handlers mostly read records by identifier; the same records are read over and over.
//! - Writes are expressed as field operators (`set`, `unset`, `inc`, `add`, `push`, `pull`), not as whole-record
//!   replacements.
//!
//! The cache operates on the following principles:
//!
//! - It is store-agnostic: everything durable goes through a [`PersistenceAdapter`].
//! - The store is the source of truth. An update is sent to the store first and only then replayed against the cached
//!   copy.
//! - There is at most one fetch in flight per identifier. Concurrent readers share its result.
//! - Models are handed out as `Arc<Model>` and are never modified in place.
//! - Implemented on top of the [moka](https://crates.io/crates/moka) cache, fully async.
//! - As a per-process cache it doesn't coordinate with other processes sharing the store.
//!
//! # Registry And Collections
//!
//! A [`Registry`] is created once per process, with an [`AdapterProvider`] and a [`CacheConfig`]. It hands out one
//! [`DataCollection`] per collection name:
//!
//! ```ignore
//! let registry = Registry::new(provider, config)?;
//! let users = registry.collection("users")?;
//!
//! let user = users.require_by_id(&id).await?;
//! users
//!     .apply_op_by_id(user.id(), &dc_update!({ "add": { "teamIds": team_id } })?)
//!     .await?;
//! ```
//!
//! # Update Operators
//!
//! See the [`op`] module for the exact semantics of every operator, the order they are applied in, and how paths into
//! nested documents behave.
//!
//! # Consistency
//!
//! Every state change of a cached identifier is serialized per identifier. A fetch result that might predate an update
//! applied while the fetch was outstanding is never installed. If the store accepted an update but the cached copy
//! cannot follow it, the copy is evicted and [`Error::CacheConsistency`] is reported; the write itself did happen
//! ([`Error::is_committed`]).
//!
//! # Testing
//!
//! With the `test` feature the [`test`] module provides an in-memory [`PersistenceAdapter`] with call counters and
//! hooks to hold or fail fetches. The `simulation` feature adds a small collaboration server simulation hammering a
//! registry from many concurrent tasks and then comparing the cache against the store.
pub mod cache;
pub mod config;
pub mod error;
pub(crate) mod flight;
pub mod model;
pub mod op;
pub mod path;
pub mod registry;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::DataCollection;
#[doc(inline)]
pub use config::CacheConfig;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use registry::Registry;
#[doc(inline)]
pub use traits::AdapterProvider;
#[doc(inline)]
pub use traits::PersistenceAdapter;

#[doc(hidden)]
pub use serde_json as __serde_json;

pub mod prelude {
    pub use crate::cache::DataCollection;
    pub use crate::config::CacheConfig;
    pub use crate::error::Error;
    pub use crate::error::ErrorKind;
    pub use crate::model::Model;
    pub use crate::op::OpKind;
    pub use crate::op::UpdateDescriptor;
    pub use crate::registry::Registry;
    pub use crate::traits::AdapterProvider;
    pub use crate::traits::PersistenceAdapter;
    pub use crate::types::Document;
    pub use crate::types::Query;
    pub use crate::types::ID_FIELD;
}

/// Builds an [`UpdateDescriptor`](crate::op::UpdateDescriptor) out of JSON notation, operator names with or without
/// the leading `$`. Evaluates to a `Result`.
///
/// ```ignore
/// let update = dc_update!({ "inc": { "postCount": 1 }, "push": { "postIds": post_id } })?;
/// ```
#[macro_export]
macro_rules! dc_update {
    ($($json:tt)+) => {
        $crate::op::UpdateDescriptor::from_json(&$crate::__serde_json::json!($($json)+))
    };
}
