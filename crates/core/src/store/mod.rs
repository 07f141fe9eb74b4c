//! SQLite-backed metadata store for sessions, requests and responses.
//!
//! - Append-mostly tables with idempotent (`INSERT OR IGNORE`) writes
//! - Automatic schema migrations
//! - WAL mode for concurrent readers across store instances
//! - Scoped transactions that roll back on any error
//! - An explicit registry that shares one store per database path

pub mod connection;
pub mod migrations;
pub mod registry;
pub mod requests;
pub mod responses;
pub mod sessions;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio_rusqlite::rusqlite::{self, Row, types::Type};

pub use connection::Store;
pub use registry::StoreRegistry;

use crate::model::parse_timestamp;

fn conversion_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(&t).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn to_json_text<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, serde_json::Error> {
    value.map(serde_json::to_string).transpose()
}
