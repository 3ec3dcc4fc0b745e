use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::cache::{CacheFactory, HashMapCache};
use crate::data_loader::DataLoader;
use crate::error::Error;

/// Callback run directly after a value was loaded successfully.
///
/// Propagators seed the caches of sibling attributes with already loaded
/// values. A user account loaded by id, for example, also carries its
/// email address; priming the `"email"` cache with it saves the second
/// round trip when the same account is later requested by email:
///
/// ```text
/// loader.prime("email", account.email.clone(), account.clone());
/// ```
///
/// The propagator runs after the attribute loader released its own lock,
/// so calling back into `prime` is the normal usage. It must not block on
/// unrelated loaders.
pub type ValuePropagator<K, V, C> = Box<dyn Fn(&V, &AttrDataLoader<K, V, C>) + Send + Sync>;

type LoaderInit<K, V, C> = Box<dyn FnOnce() -> DataLoader<K, V, C> + Send>;

/// Routes `(attribute, key)` lookups to one [`DataLoader`] per attribute.
///
/// Loaders are built lazily: the initializer registered for an attribute
/// runs on first use and is consumed, so it is invoked at most once over
/// the lifetime of this loader. Initializers run under the routing lock
/// and must not call back into the same `AttrDataLoader`.
pub struct AttrDataLoader<K, V, C = HashMapCache>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    propagators: HashMap<String, ValuePropagator<K, V, C>>,
    state: Mutex<AttrState<K, V, C>>,
}

struct AttrState<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    inits: HashMap<String, LoaderInit<K, V, C>>,
    loaders: HashMap<String, Arc<DataLoader<K, V, C>>>,
}

impl<K, V, C> Default for AttrDataLoader<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> AttrDataLoader<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    pub fn new() -> Self {
        Self {
            propagators: HashMap::new(),
            state: Mutex::new(AttrState {
                inits: HashMap::new(),
                loaders: HashMap::new(),
            }),
        }
    }

    /// Registers the loader initializer for `attribute`.
    #[must_use]
    pub fn with_loader(
        mut self,
        attribute: impl Into<String>,
        init: impl FnOnce() -> DataLoader<K, V, C> + Send + 'static,
    ) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .inits
            .insert(attribute.into(), Box::new(init));
        self
    }

    /// Registers the propagator run after successful loads of `attribute`.
    #[must_use]
    pub fn with_propagator(
        mut self,
        attribute: impl Into<String>,
        propagator: impl Fn(&V, &AttrDataLoader<K, V, C>) + Send + Sync + 'static,
    ) -> Self {
        self.propagators
            .insert(attribute.into(), Box::new(propagator));
        self
    }

    /// Loads a value by attribute and key.
    pub async fn load(&self, attribute: &str, key: K) -> Result<V, Error> {
        let loader = match self.loader(attribute) {
            Some(loader) => loader,
            None => return Err(Error::AttributeNotRegistered(attribute.to_string())),
        };
        let value = loader.load(key).await?;
        self.run_propagator(attribute, &value);
        Ok(value)
    }

    /// Loads many keys of one attribute; the result is positionally
    /// parallel to `keys`.
    ///
    /// The propagator runs once per successfully loaded value; errored
    /// positions are skipped.
    pub async fn load_all(
        &self,
        attribute: &str,
        keys: impl IntoIterator<Item = K>,
    ) -> Vec<Result<V, Error>> {
        let loader = match self.loader(attribute) {
            Some(loader) => loader,
            None => {
                let err = Error::AttributeNotRegistered(attribute.to_string());
                return keys.into_iter().map(|_| Err(err.clone())).collect();
            }
        };
        let results = loader.load_all(keys).await;
        for result in &results {
            if let Ok(value) = result {
                self.run_propagator(attribute, value);
            }
        }
        results
    }

    /// Primes the cache of `attribute` without fetching.
    ///
    /// Returns false if the key was already cached, or if the attribute is
    /// not registered.
    pub fn prime(&self, attribute: &str, key: K, value: V) -> bool {
        self.prime_with(attribute, key, value, false)
    }

    /// Primes the cache of `attribute`, overwriting any cached value.
    pub fn force_prime(&self, attribute: &str, key: K, value: V) -> bool {
        self.prime_with(attribute, key, value, true)
    }

    fn prime_with(&self, attribute: &str, key: K, value: V, force: bool) -> bool {
        match self.loader(attribute) {
            Some(loader) => loader.prime(key, value, force),
            None => false,
        }
    }

    /// Clears the value at `key` from the cache of `attribute`, if it
    /// exists.
    pub fn clear(&self, attribute: &str, key: &K) -> &Self {
        if let Some(loader) = self.loader(attribute) {
            loader.clear(key);
        }
        self
    }

    fn run_propagator(&self, attribute: &str, value: &V) {
        if let Some(propagator) = self.propagators.get(attribute) {
            propagator(value, self);
        }
    }

    /// Returns the loader of `attribute`, building it on first use.
    fn loader(&self, attribute: &str) -> Option<Arc<DataLoader<K, V, C>>> {
        let mut state = self.state.lock().unwrap();
        if let Some(loader) = state.loaders.get(attribute) {
            return Some(loader.clone());
        }
        let init = state.inits.remove(attribute)?;
        tracing::debug!(attribute, "initializing attribute loader");
        let loader = Arc::new(init());
        state.loaders.insert(attribute.to_string(), loader.clone());
        Some(loader)
    }
}
