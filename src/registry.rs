use fieldx::fxstruct;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::cache::DataCollection;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::traits::AdapterProvider;

/// Collection name to [`DataCollection`] map shared by all request handlers of a process.
///
/// Collections are created on first request for their name, with an adapter from the provider and the limits from the
/// [`CacheConfig`]. Once created, a collection lives as long as the registry.
#[fxstruct(sync, no_new, default(off), builder)]
pub struct Registry<P>
where
    P: AdapterProvider,
{
    #[fieldx(get(clone), builder(required, into))]
    provider: Arc<P>,

    #[fieldx(get, default(CacheConfig::default()))]
    config: CacheConfig,

    #[fieldx(inner_mut, get, get_mut, builder(off), default(HashMap::new()))]
    collections: HashMap<String, Arc<DataCollection<P::Adapter>>>,
}

impl<P> Registry<P>
where
    P: AdapterProvider,
{
    /// A registry using a validated copy of `config`.
    pub fn new(provider: impl Into<Arc<P>>, config: CacheConfig) -> Result<Self> {
        Ok(Self::builder().provider(provider).config(config.checked()?).build()?)
    }

    /// The collection called `name`, created if this is the first time anybody asks for it.
    pub fn collection(&self, name: &str) -> Result<Arc<DataCollection<P::Adapter>>> {
        if let Some(collection) = self.collections().get(name) {
            return Ok(collection.clone());
        }

        let mut collections = self.collections_mut();
        // Someone could have been quicker while we waited for the write lock.
        if let Some(collection) = collections.get(name) {
            return Ok(collection.clone());
        }

        let config = self.config();
        let collection = DataCollection::builder()
            .name(name)
            .adapter(self.provider().adapter_for(name))
            .max_capacity(config.capacity_for(name))
            .time_to_idle(config.time_to_idle())
            .build()?;
        debug!(collection = name, capacity = collection.max_capacity(), "created data collection");

        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// The collection called `name` if it was already created.
    pub fn get(&self, name: &str) -> Option<Arc<DataCollection<P::Adapter>>> {
        self.collections().get(name).cloned()
    }

    /// Names of the created collections, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections().keys().cloned().collect();
        names.sort();
        names
    }

    /// Empties every collection cache. The collections themselves stay registered.
    pub fn clear(&self) {
        for collection in self.collections().values() {
            collection.clear();
        }
    }
}
