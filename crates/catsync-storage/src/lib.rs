//! Shared I/O plumbing for catsync: outbound HTTP with rate limits and retry/backoff, the
//! cache providers, and the catalog client.

pub mod cache;
pub mod catalog;
pub mod http;

pub use cache::{
    cache_key, cached, cached_pages, CacheEntry, CacheError, CacheProvider, CacheValue,
    DiskCacheProvider, InMemoryCacheProvider,
};
pub use catalog::{CatalogClient, CatalogError, CatalogOptions, HttpCatalogClient, InMemoryCatalog};
pub use http::{
    endpoint, is_retryable_status, is_retryable_transport, retry_after, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RateLimit, RateLimiter, CATALOG_SOURCE, VENDOR_SOURCE,
};

pub const CRATE_NAME: &str = "catsync-storage";
