use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::attr_loader::AttrDataLoader;
use crate::cache::{CacheFactory, HashMapCache};
use crate::error::Error;

type AttrLoaderInit<K, V, C> = Box<dyn FnOnce() -> AttrDataLoader<K, V, C> + Send>;

/// Routes `(object type, attribute, key)` lookups to one
/// [`AttrDataLoader`] per object type.
///
/// Like the attribute layer, loaders are built lazily and each registered
/// initializer is consumed on first use. There are no propagators at this
/// level; values only propagate between attributes of one object type.
pub struct ObjAttrDataLoader<K, V, C = HashMapCache>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    state: Mutex<ObjAttrState<K, V, C>>,
}

struct ObjAttrState<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    inits: HashMap<String, AttrLoaderInit<K, V, C>>,
    loaders: HashMap<String, Arc<AttrDataLoader<K, V, C>>>,
}

impl<K, V, C> Default for ObjAttrDataLoader<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> ObjAttrDataLoader<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ObjAttrState {
                inits: HashMap::new(),
                loaders: HashMap::new(),
            }),
        }
    }

    /// Registers the attribute-loader initializer for `object_type`.
    #[must_use]
    pub fn with_loader(
        mut self,
        object_type: impl Into<String>,
        init: impl FnOnce() -> AttrDataLoader<K, V, C> + Send + 'static,
    ) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .inits
            .insert(object_type.into(), Box::new(init));
        self
    }

    /// Loads a value by object type, attribute and key.
    pub async fn load(&self, object_type: &str, attribute: &str, key: K) -> Result<V, Error> {
        match self.loader(object_type) {
            Some(loader) => loader.load(attribute, key).await,
            None => Err(Error::ObjectTypeNotRegistered(object_type.to_string())),
        }
    }

    /// Loads many keys of one attribute of one object type; the result is
    /// positionally parallel to `keys`.
    pub async fn load_all(
        &self,
        object_type: &str,
        attribute: &str,
        keys: impl IntoIterator<Item = K>,
    ) -> Vec<Result<V, Error>> {
        match self.loader(object_type) {
            Some(loader) => loader.load_all(attribute, keys).await,
            None => {
                let err = Error::ObjectTypeNotRegistered(object_type.to_string());
                keys.into_iter().map(|_| Err(err.clone())).collect()
            }
        }
    }

    /// Primes the cache of the attribute under `object_type` without
    /// fetching.
    pub fn prime(&self, object_type: &str, attribute: &str, key: K, value: V) -> bool {
        match self.loader(object_type) {
            Some(loader) => loader.prime(attribute, key, value),
            None => false,
        }
    }

    /// Primes the cache, overwriting any cached value.
    pub fn force_prime(&self, object_type: &str, attribute: &str, key: K, value: V) -> bool {
        match self.loader(object_type) {
            Some(loader) => loader.force_prime(attribute, key, value),
            None => false,
        }
    }

    /// Clears the value at `key` under the attribute of `object_type`.
    pub fn clear(&self, object_type: &str, attribute: &str, key: &K) -> &Self {
        if let Some(loader) = self.loader(object_type) {
            loader.clear(attribute, key);
        }
        self
    }

    fn loader(&self, object_type: &str) -> Option<Arc<AttrDataLoader<K, V, C>>> {
        let mut state = self.state.lock().unwrap();
        if let Some(loader) = state.loaders.get(object_type) {
            return Some(loader.clone());
        }
        let init = state.inits.remove(object_type)?;
        tracing::debug!(object_type, "initializing object type loader");
        let loader = Arc::new(init());
        state.loaders.insert(object_type.to_string(), loader.clone());
        Some(loader)
    }
}
