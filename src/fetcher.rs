use std::sync::Arc;

use crate::error::FetchError;

/// Reply of one fetch call, positionally parallel to the requested keys.
///
/// The variants encode how failures were reported: not at all, once per
/// key, or as a single error covering the whole batch. A shared error is
/// observed by every caller whose key was in the batch.
#[derive(Debug)]
pub enum FetchResult<V> {
    /// One value per key, in key order.
    Values(Vec<V>),

    /// One outcome per key, in key order.
    PerKey(Vec<Result<V, FetchError>>),

    /// One error shared by every key of the batch.
    Shared(FetchError),
}

impl<V> FetchResult<V> {
    /// Shared-error reply from any [`anyhow`] error.
    pub fn shared(err: anyhow::Error) -> Self {
        FetchResult::Shared(Arc::new(err))
    }
}

/// Turns a batch of keys into values in one backend round trip.
///
/// The reply must be positionally parallel to `keys`; a reply of the wrong
/// length is turned into a shared error for the whole batch. Implementations
/// must tolerate concurrent invocation across different loaders, but a
/// single batch is never dispatched twice.
#[async_trait::async_trait]
pub trait Fetcher<K>: Send + Sync + 'static {
    type Value: Send + Sync + Clone + 'static;

    async fn fetch(&self, keys: &[K]) -> FetchResult<Self::Value>;
}
