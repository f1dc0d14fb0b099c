//! A byte-capped, disk-persisted HTTP response cache and the fetch client
//! that consults it.

mod cache;
mod client;

pub use cache::{CacheEntry, CacheError, HttpCache};
pub use client::{CachePolicy, CacheClient, FetchError, FetchResponse, parse_age, parse_cache_control};
