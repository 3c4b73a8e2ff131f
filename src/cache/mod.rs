//! Read-path caching for derived list views.
//!
//! Gallery and history pages are memoized by their full read-query signature
//! ([`ReadQuery`]) in a [`CacheBackend`](crate::application::ports::CacheBackend). The job
//! ledger itself is never cached.
//!
//! ```toml
//! [cache]
//! enabled = true
//! ttl_seconds = 60
//! capacity = 1024
//! ```

mod config;
mod keys;
pub(crate) mod lock;
mod read_cache;
mod store;

pub use config::CacheConfig;
pub use keys::{ReadQuery, ReadView, keys_affected_by};
pub use read_cache::ReadCache;
pub use store::LocalCacheBackend;
