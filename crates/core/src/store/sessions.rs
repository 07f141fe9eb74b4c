//! Session rows.

use chrono::{DateTime, Utc};
use tokio_rusqlite::{params, rusqlite};

use super::{Store, opt_timestamp_col, parsed_col, timestamp_col};
use crate::Error;
use crate::model::{Session, format_timestamp};

const SESSION_COLUMNS: &str = "id, source, mode, as_of, started_at, ended_at";

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        source: row.get(1)?,
        mode: parsed_col(row, 2)?,
        as_of: opt_timestamp_col(row, 3)?,
        started_at: timestamp_col(row, 4)?,
        ended_at: opt_timestamp_col(row, 5)?,
    })
}

/// Insert `session` on an open connection or transaction; existing ids are left alone.
pub(crate) fn insert_session_tx(conn: &rusqlite::Connection, session: &Session) -> Result<(), Error> {
    conn.execute(
        "INSERT OR IGNORE INTO sessions (id, source, mode, as_of, started_at, ended_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &session.id,
            &session.source,
            session.mode.as_str(),
            session.as_of.as_ref().map(format_timestamp),
            format_timestamp(&session.started_at),
            session.ended_at.as_ref().map(format_timestamp),
        ],
    )?;
    Ok(())
}

impl Store {
    /// Insert a session. Re-inserting an existing id is a no-op.
    pub async fn insert_session(&self, session: &Session) -> Result<(), Error> {
        let session = session.clone();
        self.conn
            .call(move |conn| insert_session_tx(conn, &session))
            .await
            .map_err(Error::from)
    }

    /// Set (or clear, with `None`) a session's end timestamp.
    pub async fn mark_session_ended(&self, id: &str, ended_at: Option<DateTime<Utc>>) -> Result<(), Error> {
        let id = id.to_string();
        let ended_at = ended_at.as_ref().map(format_timestamp);
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute("UPDATE sessions SET ended_at = ?1 WHERE id = ?2", params![ended_at, id])?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Get a session by id.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Session>, Error> {
                let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
                match stmt.query_row(params![id], session_from_row) {
                    Ok(s) => Ok(Some(s)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// All sessions, most recently started first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<Session>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC, rowid DESC"
                ))?;
                let rows = stmt.query_map([], session_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Id of the newest session for `source`, if any.
    pub async fn get_latest_session_id(&self, source: &str) -> Result<Option<String>, Error> {
        let source = source.to_string();
        self.conn
            .call(move |conn| -> Result<Option<String>, Error> {
                let result = conn.query_row(
                    "SELECT id FROM sessions WHERE source = ?1 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                    params![source],
                    |row| row.get(0),
                );
                match result {
                    Ok(id) => Ok(Some(id)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }
}
