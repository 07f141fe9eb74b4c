//! Request rows.

use serde_json::{Map, Value};
use tokio_rusqlite::{params, rusqlite};

use super::{Store, json_col, parsed_col, timestamp_col, to_json_text};
use crate::Error;
use crate::model::{Request, format_timestamp};

const REQUEST_COLUMNS: &str = "id, session_id, kind, method, params, body, hash, as_of_bucket, cache_tag, created_at";

fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Request> {
    let params: Option<Map<String, Value>> = json_col(row, 4)?;
    Ok(Request {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: row.get(2)?,
        method: parsed_col(row, 3)?,
        params: params.unwrap_or_default(),
        body: json_col(row, 5)?,
        hash: row.get(6)?,
        as_of_bucket: row.get(7)?,
        cache_tag: row.get(8)?,
        created_at: timestamp_col(row, 9)?,
    })
}

pub(crate) fn insert_request_tx(conn: &rusqlite::Connection, request: &Request) -> Result<(), Error> {
    let params_text = serde_json::to_string(&request.params)?;
    let body_text = to_json_text(request.body.as_ref())?;
    conn.execute(
        "INSERT OR IGNORE INTO requests
             (id, session_id, kind, method, params, body, hash, as_of_bucket, cache_tag, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            &request.id,
            &request.session_id,
            &request.kind,
            request.method.as_str(),
            params_text,
            body_text,
            &request.hash,
            &request.as_of_bucket,
            &request.cache_tag,
            format_timestamp(&request.created_at),
        ],
    )?;
    Ok(())
}

impl Store {
    /// Insert a request. Re-inserting an existing id is a no-op.
    pub async fn insert_request(&self, request: &Request) -> Result<(), Error> {
        let request = request.clone();
        self.conn
            .call(move |conn| insert_request_tx(conn, &request))
            .await
            .map_err(Error::from)
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<Request>, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Request>, Error> {
                let mut stmt = conn.prepare(&format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"))?;
                match stmt.query_row(params![id], request_from_row) {
                    Ok(r) => Ok(Some(r)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Requests made within a session, oldest first.
    pub async fn requests_for_session(&self, session_id: &str) -> Result<Vec<Request>, Error> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<Request>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests WHERE session_id = ?1 ORDER BY created_at, rowid"
                ))?;
                let rows = stmt.query_map(params![session_id], request_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }
}
