use std::borrow::Cow;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::oneshot;
use futures_timer::Delay;
use futures_util::future::join_all;

use crate::cache::{CacheFactory, CacheStorage, HashMapCache};
use crate::error::Error;
use crate::fetcher::{FetchResult, Fetcher};

/// Batching and caching loader for a single key space.
///
/// Concurrently issued loads are coalesced into one fetch per batching
/// window: the first key to arrive opens a batch and starts the delay
/// timer, later keys join it, and the batch is dispatched when the timer
/// fires or the size cap is reached, whichever comes first. Successful
/// results are cached for the lifetime of the loader; failed keys are not,
/// so callers may retry them.
///
/// Loads must be issued from within a tokio runtime.
///
/// Reference: <https://github.com/facebook/dataloader>
pub struct DataLoader<K, V, C = HashMapCache>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    inner: Arc<DataLoaderInner<K, V, C>>,
    wait: Duration,
    max_batch: usize,
}

struct DataLoaderInner<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    fetcher: Box<dyn Fetcher<K, Value = V>>,
    state: Mutex<State<K, V, C>>,
}

struct State<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    cache: C::Storage,
    batch: Option<Batch<K, V>>,
    // generation of the open batch; bumped whenever one is opened
    seq: u64,
}

struct Batch<K, V> {
    id: u64,
    keys: Vec<K>,
    waiters: Vec<oneshot::Sender<Arc<FetchResult<V>>>>,
}

impl<K, V> DataLoader<K, V, HashMapCache>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
{
    /// Creates a loader with the default hash-map cache.
    pub fn new<F>(fetcher: F) -> Self
    where
        F: Fetcher<K, Value = V>,
    {
        Self::with_cache(fetcher, HashMapCache::default())
    }
}

impl<K, V, C> DataLoader<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    /// Creates a loader with a cache factory.
    pub fn with_cache<F>(fetcher: F, cache_factory: C) -> Self
    where
        F: Fetcher<K, Value = V>,
    {
        Self {
            inner: Arc::new(DataLoaderInner {
                fetcher: Box::new(fetcher),
                state: Mutex::new(State {
                    cache: cache_factory.create(),
                    batch: None,
                    seq: 0,
                }),
            }),
            wait: Duration::from_millis(1),
            max_batch: 0,
        }
    }

    /// How long a batch stays open for more keys, the default is `1ms`.
    #[must_use]
    pub fn delay(self, wait: Duration) -> Self {
        Self { wait, ..self }
    }

    /// Maximum keys per fetch, `0` (the default) places no bound.
    ///
    /// A batch that reaches the bound is dispatched immediately.
    #[must_use]
    pub fn max_batch_size(self, max_batch: usize) -> Self {
        Self { max_batch, ..self }
    }

    /// Loads a value by key, batching and caching applied automatically.
    pub async fn load(&self, key: K) -> Result<V, Error> {
        self.load_thunk(key).await
    }

    /// Enqueues `key` right away and returns a deferred handle to the
    /// result.
    ///
    /// The handle lets one caller enqueue loads across several loaders
    /// before awaiting any of them. Awaiting it blocks until the owning
    /// batch completes; a cache hit resolves immediately.
    pub fn load_thunk(&self, key: K) -> impl Future<Output = Result<V, Error>> + Send + 'static {
        enum Enqueued<V> {
            Hit(V),
            Wait {
                rx: oneshot::Receiver<Arc<FetchResult<V>>>,
                pos: usize,
            },
        }

        // batch id whose window this caller must start
        let mut window = None;
        // batch detached here because this key filled it
        let mut full = None;

        let enqueued = {
            let mut state = self.inner.state.lock().unwrap();

            let hit = state.cache.get(&key).cloned();
            if let Some(value) = hit {
                Enqueued::Hit(value)
            } else {
                if state.batch.is_none() {
                    state.seq += 1;
                }
                let id = state.seq;
                let batch = state.batch.get_or_insert_with(|| Batch {
                    id,
                    keys: Vec::new(),
                    waiters: Vec::new(),
                });

                // identical keys arriving before the batch closes share a
                // position, so the fetcher sees each key once
                let (pos, appended) = match batch.keys.iter().position(|existing| existing == &key)
                {
                    Some(pos) => (pos, false),
                    None => {
                        batch.keys.push(key.clone());
                        (batch.keys.len() - 1, true)
                    }
                };

                let (tx, rx) = oneshot::channel();
                batch.waiters.push(tx);

                let reached_cap =
                    appended && self.max_batch > 0 && batch.keys.len() >= self.max_batch;

                if appended && pos == 0 {
                    window = Some(id);
                }
                if reached_cap {
                    full = state.batch.take();
                }

                Enqueued::Wait { rx, pos }
            }
        };

        if let Some(id) = window {
            let inner = self.inner.clone();
            let wait = self.wait;
            tokio::spawn(async move {
                Delay::new(wait).await;
                let expired = {
                    let mut state = inner.state.lock().unwrap();
                    if state.batch.as_ref().map(|batch| batch.id) == Some(id) {
                        state.batch.take()
                    } else {
                        // the size cap already closed this batch
                        None
                    }
                };
                if let Some(batch) = expired {
                    inner.dispatch(batch).await;
                }
            });
        }

        if let Some(batch) = full {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.dispatch(batch).await });
        }

        let inner = self.inner.clone();
        async move {
            match enqueued {
                Enqueued::Hit(value) => Ok(value),
                Enqueued::Wait { rx, pos } => {
                    let reply = match rx.await {
                        Ok(reply) => reply,
                        Err(oneshot::Canceled) => {
                            return Err(Error::fetch(anyhow::anyhow!(
                                "batch was dropped before its fetch completed"
                            )))
                        }
                    };

                    let result = match reply.as_ref() {
                        FetchResult::Values(values) => Ok(values[pos].clone()),
                        FetchResult::PerKey(results) => results[pos].clone().map_err(Error::Fetch),
                        FetchResult::Shared(err) => Err(Error::Fetch(err.clone())),
                    };

                    if let Ok(value) = &result {
                        let mut state = inner.state.lock().unwrap();
                        state.cache.insert(Cow::Borrowed(&key), Cow::Borrowed(value));
                    }

                    result
                }
            }
        }
    }

    /// Loads many keys at once; the result is positionally parallel to
    /// `keys`.
    ///
    /// Keys are broken into batches according to how the loader is
    /// configured.
    pub async fn load_all(&self, keys: impl IntoIterator<Item = K>) -> Vec<Result<V, Error>> {
        let thunks: Vec<_> = keys.into_iter().map(|key| self.load_thunk(key)).collect();
        join_all(thunks).await
    }

    /// Primes the cache with the provided key and value without fetching.
    ///
    /// If the key is already cached and `force` is false, no change is
    /// made and false is returned.
    pub fn prime(&self, key: K, value: V, force: bool) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if force || state.cache.get(&key).is_none() {
            state.cache.insert(Cow::Owned(key), Cow::Owned(value));
            true
        } else {
            false
        }
    }

    /// Clears the value at `key` from the cache, if it exists.
    ///
    /// A batch that already enqueued the key is unaffected; its waiters
    /// still receive the fetched value.
    pub fn clear(&self, key: &K) -> &Self {
        let mut state = self.inner.state.lock().unwrap();
        state.cache.remove(key);
        self
    }

    /// Clears the whole cache.
    pub fn clear_all(&self) -> &Self {
        let mut state = self.inner.state.lock().unwrap();
        state.cache.clear();
        self
    }
}

impl<K, V, C> DataLoaderInner<K, V, C>
where
    K: Send + Sync + Eq + Hash + Clone + 'static,
    V: Send + Sync + Clone + 'static,
    C: CacheFactory<K, V>,
{
    /// Runs the fetcher for a detached batch and releases every waiter.
    ///
    /// Runs outside all loader locks; each batch is dispatched exactly
    /// once.
    async fn dispatch(&self, batch: Batch<K, V>) {
        tracing::debug!(keys = batch.keys.len(), "dispatching batch");
        let reply = self.fetcher.fetch(&batch.keys).await;
        let reply = Arc::new(check_reply(reply, batch.keys.len()));
        for waiter in batch.waiters {
            // the receiver may have been dropped by an abandoned caller
            let _ = waiter.send(reply.clone());
        }
    }
}

/// Guards the positional contract: a reply of the wrong length becomes a
/// shared error instead of misaligned results.
fn check_reply<V>(reply: FetchResult<V>, expected: usize) -> FetchResult<V> {
    let got = match &reply {
        FetchResult::Values(values) => values.len(),
        FetchResult::PerKey(results) => results.len(),
        FetchResult::Shared(_) => return reply,
    };
    if got == expected {
        reply
    } else {
        FetchResult::shared(anyhow::anyhow!(
            "fetcher returned {got} results for {expected} keys"
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    use fnv::FnvBuildHasher;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::LruCache;
    use crate::error::is_loading_error;

    struct Doubling {
        calls: Arc<Mutex<Vec<Vec<i32>>>>,
    }

    #[async_trait::async_trait]
    impl Fetcher<i32> for Doubling {
        type Value = i32;

        async fn fetch(&self, keys: &[i32]) -> FetchResult<i32> {
            self.calls.lock().unwrap().push(keys.to_vec());
            FetchResult::Values(keys.iter().map(|key| key * 2).collect())
        }
    }

    fn doubling() -> (Doubling, Arc<Mutex<Vec<Vec<i32>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (Doubling { calls: calls.clone() }, calls)
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Fetcher<i32> for Failing {
        type Value = i32;

        async fn fetch(&self, _keys: &[i32]) -> FetchResult<i32> {
            FetchResult::shared(anyhow::anyhow!("backend down"))
        }
    }

    #[tokio::test]
    async fn batches_concurrent_loads() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher).delay(Duration::from_millis(10));

        let results = join_all([loader.load(1), loader.load(2), loader.load(3)]).await;
        let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![2, 4, 6]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let mut keys = calls[0].clone();
        keys.sort();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn caches_loaded_values() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher);

        assert_eq!(loader.load(1).await.unwrap(), 2);
        assert_eq!(loader.load(1).await.unwrap(), 2);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dedups_keys_within_a_batch() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher).delay(Duration::from_millis(10));

        let results = join_all([loader.load(1), loader.load(1), loader.load(1)]).await;
        for result in results {
            assert_eq!(result.unwrap(), 2);
        }
        assert_eq!(*calls.lock().unwrap(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn splits_batches_at_the_size_cap() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher)
            .delay(Duration::from_millis(20))
            .max_batch_size(2);

        let results = join_all([loader.load(1), loader.load(2), loader.load(3)]).await;
        let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![2, 4, 6]);

        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn thunks_enqueue_before_blocking() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher).delay(Duration::from_millis(10));

        let first = loader.load_thunk(1);
        let second = loader.load_thunk(2);

        assert_eq!(first.await.unwrap(), 2);
        assert_eq!(second.await.unwrap(), 4);
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn load_all_preserves_key_order() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher);

        let results = loader.load_all(vec![3, 1, 2]).await;
        let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![6, 2, 4]);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn primed_values_skip_the_fetcher() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher);

        assert!(loader.prime(1, 10, false));
        assert!(!loader.prime(1, 99, false));
        assert_eq!(loader.load(1).await.unwrap(), 10);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_prime_overwrites() {
        let (fetcher, _calls) = doubling();
        let loader = DataLoader::new(fetcher);

        loader.prime(1, 10, false);
        assert!(loader.prime(1, 99, true));
        assert_eq!(loader.load(1).await.unwrap(), 99);
    }

    #[tokio::test]
    async fn clear_forces_a_refetch() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher);

        loader.load(1).await.unwrap();
        loader.clear(&1);
        loader.load(1).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clear_all_empties_the_cache() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::new(fetcher);

        loader.load_all(vec![1, 2]).await;
        loader.clear_all();
        loader.load_all(vec![1, 2]).await;
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shared_errors_reach_every_caller_and_skip_the_cache() {
        let loader = DataLoader::new(Failing).delay(Duration::from_millis(10));

        let results = join_all([loader.load(1), loader.load(2)]).await;
        for result in results {
            let err = result.unwrap_err();
            assert!(is_loading_error(&err));
            assert_eq!(err.to_string(), "backend down");
        }

        // nothing was cached, so the next load hits the fetcher again
        assert!(loader.load(1).await.is_err());
    }

    struct EvenOnly;

    #[async_trait::async_trait]
    impl Fetcher<i32> for EvenOnly {
        type Value = i32;

        async fn fetch(&self, keys: &[i32]) -> FetchResult<i32> {
            FetchResult::PerKey(
                keys.iter()
                    .map(|key| {
                        if key % 2 == 0 {
                            Ok(key * 2)
                        } else {
                            Err(Arc::new(anyhow::anyhow!("odd key {key}")))
                        }
                    })
                    .collect(),
            )
        }
    }

    #[tokio::test]
    async fn per_key_errors_are_positional() {
        let loader = DataLoader::new(EvenOnly).delay(Duration::from_millis(10));

        let results = loader.load_all(vec![2, 3]).await;
        assert_eq!(results[0].as_ref().unwrap(), &4);
        assert_eq!(results[1].as_ref().unwrap_err().to_string(), "odd key 3");
    }

    struct ShortChanging;

    #[async_trait::async_trait]
    impl Fetcher<i32> for ShortChanging {
        type Value = i32;

        async fn fetch(&self, _keys: &[i32]) -> FetchResult<i32> {
            FetchResult::Values(vec![1])
        }
    }

    #[tokio::test]
    async fn mismatched_reply_lengths_surface_as_errors() {
        let loader = DataLoader::new(ShortChanging).delay(Duration::from_millis(10));

        let results = join_all([loader.load(1), loader.load(2)]).await;
        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.to_string(), "fetcher returned 1 results for 2 keys");
        }
    }

    #[tokio::test]
    async fn with_cache_hash_map_fnv() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::with_cache(fetcher, HashMapCache::<FnvBuildHasher>::new());

        assert_eq!(loader.load(1).await.unwrap(), 2);
        assert_eq!(loader.load(1).await.unwrap(), 2);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn with_lru_cache_refetches_evicted_keys() {
        let (fetcher, calls) = doubling();
        let loader = DataLoader::with_cache(fetcher, LruCache::new(NonZeroUsize::new(1).unwrap()));

        loader.load(1).await.unwrap();
        loader.load(2).await.unwrap();
        loader.load(1).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    struct Slow;

    #[async_trait::async_trait]
    impl Fetcher<i32> for Slow {
        type Value = i32;

        async fn fetch(&self, keys: &[i32]) -> FetchResult<i32> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            FetchResult::Values(keys.to_vec())
        }
    }

    #[tokio::test]
    async fn aborted_callers_do_not_wedge_the_batch() {
        let loader = Arc::new(DataLoader::new(Slow).delay(Duration::from_millis(20)));

        let handle = tokio::spawn({
            let loader = loader.clone();
            async move {
                loader.load(1).await.unwrap();
            }
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.abort();

        // joins the batch the aborted caller opened
        assert_eq!(loader.load(2).await.unwrap(), 2);
    }
}
