//! Request-scoped data loading: batching, caching and deduplication of
//! lookups against slow backends.
//!
//! A [`DataLoader`] coalesces concurrently issued single-key loads into
//! one bounded fetch per batching window and caches the results for its
//! own lifetime. An [`AttrDataLoader`] routes loads to one `DataLoader`
//! per named attribute and can propagate loaded values into sibling
//! attribute caches; an [`ObjAttrDataLoader`] routes one level higher, by
//! object type. Loaders are meant to be created per unit of work (one
//! request) and dropped with it, which is why the default cache is
//! unbounded.
//!
//! ```
//! use dataloaders::{DataLoader, FetchResult, Fetcher};
//!
//! struct Doubler;
//!
//! #[async_trait::async_trait]
//! impl Fetcher<i32> for Doubler {
//!     type Value = i32;
//!
//!     async fn fetch(&self, keys: &[i32]) -> FetchResult<i32> {
//!         FetchResult::Values(keys.iter().map(|key| key * 2).collect())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let loader = DataLoader::new(Doubler);
//!
//! // both loads end up in one fetch call
//! let (a, b) = tokio::join!(loader.load(1), loader.load(2));
//! assert_eq!(a.unwrap(), 2);
//! assert_eq!(b.unwrap(), 4);
//! # }
//! ```

pub mod attr_loader;
pub mod cache;
pub mod data_loader;
pub mod error;
pub mod fetcher;
pub mod obj_attr_loader;

pub use attr_loader::{AttrDataLoader, ValuePropagator};
pub use cache::{CacheFactory, CacheStorage, HashMapCache, LruCache};
pub use data_loader::DataLoader;
pub use error::{is_loading_error, Error, FetchError};
pub use fetcher::{FetchResult, Fetcher};
pub use obj_attr_loader::ObjAttrDataLoader;
