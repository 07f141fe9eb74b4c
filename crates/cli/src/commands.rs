//! Command implementations.
//!
//! Each command writes to the given writer and reports through its return
//! value whether the process should exit successfully.

use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use dataio_core::{Error, Session, Store};

/// Outcome of `verify`.
#[derive(Debug, Serialize)]
pub struct VerifyOutput {
    pub checksum: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Responses that reference this payload.
    pub responses: usize,
}

pub async fn sessions(store: &Store, source: Option<&str>, limit: Option<usize>, out: &mut impl Write) -> Result<()> {
    let sessions: Vec<Session> = store
        .list_sessions()
        .await?
        .into_iter()
        .filter(|s| source.is_none_or(|src| s.source == src))
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    serde_json::to_writer_pretty(&mut *out, &sessions)?;
    writeln!(out)?;
    Ok(())
}

/// Returns `false` when the source has no sessions.
pub async fn latest(store: &Store, source: &str, out: &mut impl Write) -> Result<bool> {
    match store.get_latest_session_id(source).await? {
        Some(id) => {
            writeln!(out, "{id}")?;
            Ok(true)
        }
        None => {
            tracing::warn!(source, "no sessions recorded for source");
            Ok(false)
        }
    }
}

pub async fn cat(store: &Store, checksum: &str, out: &mut impl Write) -> Result<()> {
    let data = store.read_payload(checksum).await?;
    out.write_all(&data)?;
    Ok(())
}

/// Returns `false` when the payload is missing or corrupt.
pub async fn verify(store: &Store, checksum: &str, out: &mut impl Write) -> Result<bool> {
    let responses = store.responses_with_checksum(checksum).await?.len();
    let output = match store.read_payload(checksum).await {
        Ok(data) => {
            VerifyOutput { checksum: checksum.to_string(), ok: true, size_bytes: Some(data.len()), error: None, responses }
        }
        Err(e @ (Error::ChecksumMismatch { .. } | Error::PayloadNotFound(_))) => {
            VerifyOutput { checksum: checksum.to_string(), ok: false, size_bytes: None, error: Some(e.to_string()), responses }
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::to_writer_pretty(&mut *out, &output)?;
    writeln!(out)?;
    Ok(output.ok)
}

pub async fn meta(store: &Store, checksum: &str, out: &mut impl Write) -> Result<()> {
    let meta = store.read_metadata(checksum).await?;
    serde_json::to_writer_pretty(&mut *out, &meta)?;
    writeln!(out)?;
    Ok(())
}
