//! Core types and persistence for dataio.
//!
//! This crate provides:
//! - Request fingerprinting and canonical JSON
//! - Content-addressed payload store with sidecar metadata
//! - SQLite metadata store for sessions, requests and responses
//! - Cache policy engine
//! - Unified error types and layered configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod model;
pub mod payload;
pub mod policy;
pub mod store;

pub use config::{ConfigError, DataIoConfig};
pub use error::{AdapterError, Error};
pub use model::{
    AdapterOutput, AdapterResult, Request, RequestMethod, RequestSpec, Response, ResponseStatus, SendPayload, Session,
    SessionMode,
};
pub use payload::PayloadStore;
pub use policy::{CacheDecision, CacheMode, CachePolicy};
pub use store::{Store, StoreRegistry};
