//! Adapter contract.
//!
//! An adapter is the bridge to one external system. Every adapter has an
//! identity, a description and a teardown hook; what it can actually do is
//! advertised through the capability accessors, which the session checks
//! before dispatch.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use dataio_core::{AdapterError, AdapterOutput, Request};

/// Retrieves data for a request.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<AdapterOutput, AdapterError>;
}

/// Pushes a payload to the external system.
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, request: &Request, payload: Bytes) -> Result<AdapterOutput, AdapterError>;
}

/// Delivers a continuous feed into `sink` until the feed ends or the
/// receiver is dropped. Nothing streamed is persisted.
#[async_trait::async_trait]
pub trait Streamer: Send + Sync {
    async fn stream(&self, request: &Request, sink: mpsc::Sender<Bytes>) -> Result<(), AdapterError>;
}

/// A pluggable connection to one external system.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Registry name of the external system, e.g. `"justetf"`.
    fn source(&self) -> &str;

    fn describe(&self) -> String {
        format!("{} adapter", self.source())
    }

    /// Release held resources. Called when a session over this adapter closes.
    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn as_fetcher(&self) -> Option<&dyn Fetcher> {
        None
    }

    fn as_sender(&self) -> Option<&dyn Sender> {
        None
    }

    fn as_streamer(&self) -> Option<&dyn Streamer> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fetch: self.as_fetcher().is_some(),
            send: self.as_sender().is_some(),
            stream: self.as_streamer().is_some(),
        }
    }
}

/// Which capabilities an adapter exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub fetch: bool,
    pub send: bool,
    pub stream: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(self.fetch, "fetch"), (self.send, "send"), (self.stream, "stream")]
            .into_iter()
            .filter_map(|(on, name)| on.then_some(name))
            .collect();
        if names.is_empty() { f.write_str("none") } else { f.write_str(&names.join(",")) }
    }
}
