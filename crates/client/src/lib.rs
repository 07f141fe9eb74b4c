//! Session orchestration for dataio.
//!
//! This crate provides the adapter contract and registry, short-circuit
//! cache stores, and [`DataIoSession`], the entry point that ties adapters
//! to the persistence layer in `dataio-core`.

pub mod adapter;
pub mod cache_store;
pub mod registry;
pub mod session;

pub use adapter::{Adapter, Capabilities, Fetcher, Sender, Streamer};
pub use cache_store::{CacheStore, FileCacheStore, MemoryCacheStore};
pub use registry::AdapterRegistry;
pub use session::{DataIoSession, SessionOptions};
