//! Response rows and cache lookups.

use std::collections::BTreeMap;

use tokio_rusqlite::{params, rusqlite};

use super::{Store, conversion_err, json_col, opt_parsed_col, parsed_col, timestamp_col, to_json_text};
use crate::Error;
use crate::model::{Response, format_timestamp};

const RESPONSE_COLUMNS: &str = "resp.id, resp.request_id, resp.status, resp.checksum, resp.path, resp.size_bytes,
     resp.content_type, resp.transport_status, resp.url, resp.elapsed_ms, resp.headers, resp.adapter_meta,
     resp.fetched_at, resp.cache_mode, resp.ttl_seconds, resp.as_of_bucket, resp.cache_tag";

/// Servable rows only: stored payloads that did not record an error.
const SERVABLE: &str = "resp.checksum IS NOT NULL AND resp.status != 'error'";

fn unsigned_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(idx)?;
    value.map(|v| u64::try_from(v).map_err(|e| conversion_err(idx, e))).transpose()
}

fn response_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Response> {
    let transport_status: Option<i64> = row.get(7)?;
    let transport_status = transport_status
        .map(|v| u16::try_from(v).map_err(|e| conversion_err(7, e)))
        .transpose()?;
    let headers: Option<BTreeMap<String, String>> = json_col(row, 10)?;
    Ok(Response {
        id: row.get(0)?,
        request_id: row.get(1)?,
        status: parsed_col(row, 2)?,
        checksum: row.get(3)?,
        path: row.get(4)?,
        size_bytes: unsigned_col(row, 5)?.unwrap_or_default(),
        content_type: row.get(6)?,
        transport_status,
        url: row.get(8)?,
        elapsed_ms: unsigned_col(row, 9)?,
        headers,
        adapter_meta: json_col(row, 11)?,
        fetched_at: timestamp_col(row, 12)?,
        cache_mode: opt_parsed_col(row, 13)?,
        ttl_seconds: row.get(14)?,
        as_of_bucket: row.get(15)?,
        cache_tag: row.get(16)?,
    })
}

pub(crate) fn insert_response_tx(conn: &rusqlite::Connection, response: &Response) -> Result<(), Error> {
    let headers = to_json_text(response.headers.as_ref())?;
    let adapter_meta = to_json_text(response.adapter_meta.as_ref())?;
    conn.execute(
        "INSERT OR IGNORE INTO responses
             (id, request_id, status, checksum, path, size_bytes, content_type, transport_status, url,
              elapsed_ms, headers, adapter_meta, fetched_at, cache_mode, ttl_seconds, as_of_bucket, cache_tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            &response.id,
            &response.request_id,
            response.status.as_str(),
            &response.checksum,
            &response.path,
            response.size_bytes as i64,
            &response.content_type,
            response.transport_status.map(i64::from),
            &response.url,
            response.elapsed_ms.map(|ms| ms as i64),
            headers,
            adapter_meta,
            format_timestamp(&response.fetched_at),
            response.cache_mode.map(|m| m.as_str()),
            response.ttl_seconds,
            &response.as_of_bucket,
            &response.cache_tag,
        ],
    )?;
    Ok(())
}

fn optional(result: rusqlite::Result<Response>) -> Result<Option<Response>, Error> {
    match result {
        Ok(r) => Ok(Some(r)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Store {
    /// Insert a response. Re-inserting an existing id is a no-op.
    pub async fn insert_response(&self, response: &Response) -> Result<(), Error> {
        let response = response.clone();
        self.conn
            .call(move |conn| insert_response_tx(conn, &response))
            .await
            .map_err(Error::from)
    }

    pub async fn get_response(&self, id: &str) -> Result<Option<Response>, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Response>, Error> {
                let mut stmt = conn.prepare(&format!("SELECT {RESPONSE_COLUMNS} FROM responses resp WHERE resp.id = ?1"))?;
                optional(stmt.query_row(params![id], response_from_row))
            })
            .await
            .map_err(Error::from)
    }

    /// Newest servable response for any request with this hash.
    ///
    /// Ties on `fetched_at` go to the most recently inserted row.
    pub async fn get_cached_response_by_request_hash(&self, hash: &str) -> Result<Option<Response>, Error> {
        let hash = hash.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Response>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RESPONSE_COLUMNS}
                     FROM responses resp JOIN requests r ON resp.request_id = r.id
                     WHERE r.hash = ?1 AND {SERVABLE}
                     ORDER BY resp.fetched_at DESC, resp.rowid DESC
                     LIMIT 1"
                ))?;
                optional(stmt.query_row(params![hash], response_from_row))
            })
            .await
            .map_err(Error::from)
    }

    /// Like [`Store::get_cached_response_by_request_hash`], restricted to
    /// responses recorded under `bucket`. `None` matches rows with no bucket.
    pub async fn get_cached_response_by_request_hash_and_bucket(
        &self, hash: &str, bucket: Option<&str>,
    ) -> Result<Option<Response>, Error> {
        let hash = hash.to_string();
        let bucket = bucket.map(str::to_string);
        self.conn
            .call(move |conn| -> Result<Option<Response>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RESPONSE_COLUMNS}
                     FROM responses resp JOIN requests r ON resp.request_id = r.id
                     WHERE r.hash = ?1 AND resp.as_of_bucket IS ?2 AND {SERVABLE}
                     ORDER BY resp.fetched_at DESC, resp.rowid DESC
                     LIMIT 1"
                ))?;
                optional(stmt.query_row(params![hash, bucket], response_from_row))
            })
            .await
            .map_err(Error::from)
    }

    /// Every response recorded for a request, oldest first.
    pub async fn responses_for_request(&self, request_id: &str) -> Result<Vec<Response>, Error> {
        let request_id = request_id.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<Response>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RESPONSE_COLUMNS} FROM responses resp
                     WHERE resp.request_id = ?1 ORDER BY resp.fetched_at, resp.rowid"
                ))?;
                let rows = stmt.query_map(params![request_id], response_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Every response whose payload has this checksum, oldest first.
    pub async fn responses_with_checksum(&self, checksum: &str) -> Result<Vec<Response>, Error> {
        let checksum = checksum.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<Response>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RESPONSE_COLUMNS} FROM responses resp
                     WHERE resp.checksum = ?1 ORDER BY resp.fetched_at, resp.rowid"
                ))?;
                let rows = stmt.query_map(params![checksum], response_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }
}
