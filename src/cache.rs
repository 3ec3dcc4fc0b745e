use std::borrow::Cow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::num::NonZeroUsize;

/// Factory for the per-key cache storage of a [`DataLoader`](crate::DataLoader).
pub trait CacheFactory<K, V>: Send + Sync + 'static
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    type Storage: CacheStorage<Key = K, Value = V>;

    /// Create a cache storage.
    fn create(&self) -> Self::Storage;
}

/// Key-value storage living behind its loader's mutex.
///
/// The loader owns the storage exclusively, so implementations need no
/// locking of their own. Loaders are request-scoped; unless the storage
/// bounds itself (see [`LruCache`]), entries live until cleared or until
/// the loader is dropped.
pub trait CacheStorage: Send + Sync + 'static {
    type Key: Send + Sync + Clone + Eq + Hash + 'static;
    type Value: Send + Sync + Clone + 'static;

    /// Returns the cached value for `key`, if present.
    fn get(&mut self, key: &Self::Key) -> Option<&Self::Value>;

    /// Stores a key-value pair, replacing any previous value for the key.
    fn insert(&mut self, key: Cow<'_, Self::Key>, value: Cow<'_, Self::Value>);

    /// Removes the value for `key`, if present.
    fn remove(&mut self, key: &Self::Key);

    /// Removes every entry.
    fn clear(&mut self);
}

/// [`HashMap`]-backed cache, the default storage.
pub struct HashMapCache<S = RandomState> {
    _mark: PhantomData<S>,
}

impl<S: Send + Sync + BuildHasher + Default + 'static> HashMapCache<S> {
    /// Use the specified `S: BuildHasher` to create a `HashMap` cache.
    pub fn new() -> Self {
        Self { _mark: PhantomData }
    }
}

impl Default for HashMapCache<RandomState> {
    fn default() -> Self {
        Self { _mark: PhantomData }
    }
}

impl<K, V, S> CacheFactory<K, V> for HashMapCache<S>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
    S: Send + Sync + BuildHasher + Default + 'static,
{
    type Storage = HashMapCacheImpl<K, V, S>;

    fn create(&self) -> Self::Storage {
        HashMapCacheImpl(HashMap::default())
    }
}

pub struct HashMapCacheImpl<K, V, S>(HashMap<K, V, S>);

impl<K, V, S> CacheStorage for HashMapCacheImpl<K, V, S>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
    S: Send + Sync + BuildHasher + 'static,
{
    type Key = K;
    type Value = V;

    #[inline]
    fn get(&mut self, key: &Self::Key) -> Option<&Self::Value> {
        self.0.get(key)
    }

    #[inline]
    fn insert(&mut self, key: Cow<'_, Self::Key>, value: Cow<'_, Self::Value>) {
        self.0.insert(key.into_owned(), value.into_owned());
    }

    #[inline]
    fn remove(&mut self, key: &Self::Key) {
        self.0.remove(key);
    }

    #[inline]
    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Bounded LRU cache, for embedders that want a cap even within one
/// request.
pub struct LruCache {
    cap: NonZeroUsize,
}

impl LruCache {
    /// Creates an LRU cache factory holding at most `cap` entries.
    pub fn new(cap: NonZeroUsize) -> Self {
        Self { cap }
    }
}

impl<K, V> CacheFactory<K, V> for LruCache
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    type Storage = LruCacheImpl<K, V>;

    fn create(&self) -> Self::Storage {
        LruCacheImpl(lru::LruCache::new(self.cap))
    }
}

pub struct LruCacheImpl<K, V>(lru::LruCache<K, V>);

impl<K, V> CacheStorage for LruCacheImpl<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    type Key = K;
    type Value = V;

    #[inline]
    fn get(&mut self, key: &Self::Key) -> Option<&Self::Value> {
        self.0.get(key)
    }

    #[inline]
    fn insert(&mut self, key: Cow<'_, Self::Key>, value: Cow<'_, Self::Value>) {
        self.0.put(key.into_owned(), value.into_owned());
    }

    #[inline]
    fn remove(&mut self, key: &Self::Key) {
        self.0.pop(key);
    }

    #[inline]
    fn clear(&mut self) {
        self.0.clear();
    }
}
