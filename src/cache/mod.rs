//! # Cache Module
//!
//! Time-bounded caching used by the document store.
//!
//! Entries expire after a configurable TTL and are dropped lazily on read
//! or eagerly by [`TtlCache::cleanup_expired`]. The cache is a thin layer over
//! [`dashmap::DashMap`], so it can be shared between tasks without an outer
//! lock; callers that need read-modify-write atomicity hold their own mutex.

pub mod ttl_cache;

pub use ttl_cache::TtlCache;
