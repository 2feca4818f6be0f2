use chrono::Utc;
use rusqlite::Connection;
use tracing::instrument;

use merlin_core::ids::SessionId;
use merlin_core::prompt::Role;
use merlin_core::repository::StoredMessage;
use merlin_core::stream::Usage;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "chat_messages";

/// A message about to be written.
#[derive(Clone, Debug)]
pub struct NewMessage<'a> {
    pub role: Role,
    pub content: &'a str,
    pub client_message_id: Option<&'a str>,
    pub usage: Option<Usage>,
}

impl<'a> NewMessage<'a> {
    pub fn new(role: Role, content: &'a str) -> Self {
        Self {
            role,
            content,
            client_message_id: None,
            usage: None,
        }
    }
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, message), fields(session_id = %session_id, role = %message.role))]
    pub fn insert(
        &self,
        session_id: &SessionId,
        message: &NewMessage<'_>,
    ) -> Result<StoredMessage, StoreError> {
        self.db.with_conn(|conn| insert(conn, session_id, message))
    }

    /// Messages in ascending id order. With `after`, the first `limit`
    /// messages following that id; without it, the latest `limit`.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.db
            .with_conn(|conn| list(conn, session_id, after, limit))
    }

    pub fn count(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

pub(crate) fn insert(
    conn: &Connection,
    session_id: &SessionId,
    message: &NewMessage<'_>,
) -> Result<StoredMessage, StoreError> {
    let created_at = Utc::now();
    let (tokens_in, tokens_out) = match message.usage {
        Some(usage) => (Some(usage.prompt_tokens), Some(usage.completion_tokens)),
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO chat_messages (session_id, role, content, client_message_id,
             tokens_in, tokens_out, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            session_id.as_str(),
            message.role.as_str(),
            message.content,
            message.client_message_id,
            tokens_in,
            tokens_out,
            row_helpers::timestamp(created_at),
        ],
    )?;
    Ok(StoredMessage {
        id: conn.last_insert_rowid(),
        role: message.role,
        content: message.content.to_owned(),
        created_at,
    })
}

pub(crate) fn list(
    conn: &Connection,
    session_id: &SessionId,
    after: Option<i64>,
    limit: usize,
) -> Result<Vec<StoredMessage>, StoreError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let limit = limit as i64;

    let messages = match after {
        Some(after) => {
            let mut stmt = conn.prepare(
                "SELECT message_id, role, content, created_at FROM chat_messages
                 WHERE session_id = ?1 AND message_id > ?2
                 ORDER BY message_id ASC LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), after, limit])?;
            collect(&mut rows)?
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT message_id, role, content, created_at FROM chat_messages
                 WHERE session_id = ?1
                 ORDER BY message_id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
            let mut latest = collect(&mut rows)?;
            latest.reverse();
            latest
        }
    };
    Ok(messages)
}

fn collect(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<StoredMessage>, StoreError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_message(row)?);
    }
    Ok(out)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    let role: String = row_helpers::get(row, 1, TABLE, "role")?;
    let created_at: String = row_helpers::get(row, 3, TABLE, "created_at")?;
    Ok(StoredMessage {
        id: row_helpers::get(row, 0, TABLE, "message_id")?,
        role: row_helpers::parse_enum(&role, TABLE, "role")?,
        content: row_helpers::get(row, 2, TABLE, "content")?,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
    })
}
