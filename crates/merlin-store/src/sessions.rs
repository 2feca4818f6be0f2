use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, instrument};

use merlin_core::ids::{CharacterId, SessionId, UserId};
use merlin_core::prompt::Role;
use merlin_core::repository::SessionSnapshot;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{self, NewMessage};
use crate::row_helpers;

const TABLE: &str = "chat_sessions";
const COLUMNS: &str = "session_id, user_id, character_id, character_name, title, story_brief,
     status_summary, status_location, in_combat, character_sheet,
     created_at, updated_at, archived_at";

/// A storyline between one player and one of their characters.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub character_id: CharacterId,
    pub character_name: Option<String>,
    pub title: String,
    pub story_brief: Option<String>,
    pub status_summary: Option<String>,
    pub location: Option<String>,
    pub in_combat: bool,
    pub character_sheet: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            title: self.title.clone(),
            character_name: self.character_name.clone(),
            story_brief: self.story_brief.clone(),
            status_summary: self.status_summary.clone(),
            location: self.location.clone(),
            in_combat: self.in_combat,
            character_sheet: self.character_sheet.clone(),
        }
    }
}

/// Seed values for a session created by [`SessionRepo::get_or_create_active`].
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub character_name: Option<String>,
    pub title: String,
    pub story_brief: Option<String>,
    pub status_summary: Option<String>,
    pub location: Option<String>,
    pub character_sheet: Option<String>,
    /// Narrator message written in the same transaction as the session.
    pub opening: Option<String>,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The caller's active session for `character_id`, created from `seed`
    /// when none exists. The flag is true when the session was created.
    /// A new session and its opening message are committed together.
    #[instrument(skip(self, seed), fields(user_id = %user_id, character_id = %character_id))]
    pub fn get_or_create_active(
        &self,
        user_id: &UserId,
        character_id: &CharacterId,
        seed: &NewSession,
    ) -> Result<(SessionRow, bool), StoreError> {
        self.db.with_tx(|tx| {
            if let Some(existing) = find_active(tx, user_id, character_id)? {
                return Ok((existing, false));
            }

            let now = Utc::now();
            let row = SessionRow {
                session_id: SessionId::new(),
                user_id: user_id.clone(),
                character_id: character_id.clone(),
                character_name: seed.character_name.clone(),
                title: seed.title.clone(),
                story_brief: seed.story_brief.clone(),
                status_summary: seed.status_summary.clone(),
                location: seed.location.clone(),
                in_combat: false,
                character_sheet: seed.character_sheet.clone(),
                created_at: now,
                updated_at: now,
                archived_at: None,
            };
            tx.execute(
                "INSERT INTO chat_sessions (session_id, user_id, character_id, character_name, title,
                     story_brief, status_summary, status_location, in_combat, character_sheet,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?10)",
                rusqlite::params![
                    row.session_id.as_str(),
                    row.user_id.as_str(),
                    row.character_id.as_str(),
                    row.character_name,
                    row.title,
                    row.story_brief,
                    row.status_summary,
                    row.location,
                    row.character_sheet,
                    row_helpers::timestamp(now),
                ],
            )?;
            if let Some(opening) = seed.opening.as_deref() {
                messages::insert(tx, &row.session_id, &NewMessage::new(Role::Assistant, opening))?;
            }
            info!(session_id = %row.session_id, "session created");
            Ok((row, true))
        })
    }

    /// A session owned by `user_id`. Sessions of other users are reported
    /// as missing.
    #[instrument(skip(self), fields(user_id = %user_id, session_id = %session_id))]
    pub fn get(&self, user_id: &UserId, session_id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db
            .with_conn(|conn| get_owned(conn, user_id, session_id))
    }

    /// Mark the session archived. Archiving twice is a no-op.
    #[instrument(skip(self), fields(user_id = %user_id, session_id = %session_id))]
    pub fn archive(&self, user_id: &UserId, session_id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::timestamp(Utc::now());
            let changed = conn.execute(
                "UPDATE chat_sessions SET archived_at = ?1, updated_at = ?1
                 WHERE session_id = ?2 AND user_id = ?3 AND archived_at IS NULL",
                rusqlite::params![now, session_id.as_str(), user_id.as_str()],
            )?;
            if changed > 0 {
                info!("session archived");
            }
            get_owned(conn, user_id, session_id)
        })
    }
}

pub(crate) fn get_owned(
    conn: &Connection,
    user_id: &UserId,
    session_id: &SessionId,
) -> Result<SessionRow, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM chat_sessions WHERE session_id = ?1 AND user_id = ?2"
    ))?;
    let mut rows = stmt.query([session_id.as_str(), user_id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {session_id}"))),
    }
}

fn find_active(
    conn: &Connection,
    user_id: &UserId,
    character_id: &CharacterId,
) -> Result<Option<SessionRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM chat_sessions
         WHERE user_id = ?1 AND character_id = ?2 AND archived_at IS NULL
         ORDER BY created_at DESC LIMIT 1"
    ))?;
    let row = stmt
        .query_row([user_id.as_str(), character_id.as_str()], |row| {
            Ok(row_to_session(row))
        })
        .optional()?;
    row.transpose()
}

/// Touch `updated_at`, e.g. after a committed turn.
pub(crate) fn touch(conn: &Connection, session_id: &SessionId) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE chat_sessions SET updated_at = ?1 WHERE session_id = ?2",
        rusqlite::params![row_helpers::timestamp(Utc::now()), session_id.as_str()],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let session_id: String = row_helpers::get(row, 0, TABLE, "session_id")?;
    let user_id: String = row_helpers::get(row, 1, TABLE, "user_id")?;
    let character_id: String = row_helpers::get(row, 2, TABLE, "character_id")?;
    let created_at: String = row_helpers::get(row, 10, TABLE, "created_at")?;
    let updated_at: String = row_helpers::get(row, 11, TABLE, "updated_at")?;
    let archived_at: Option<String> = row_helpers::get_opt(row, 12, TABLE, "archived_at")?;
    let in_combat: i64 = row_helpers::get(row, 8, TABLE, "in_combat")?;

    Ok(SessionRow {
        session_id: SessionId::from_raw(session_id),
        user_id: UserId::from_raw(user_id),
        character_id: CharacterId::from_raw(character_id),
        character_name: row_helpers::get_opt(row, 3, TABLE, "character_name")?,
        title: row_helpers::get(row, 4, TABLE, "title")?,
        story_brief: row_helpers::get_opt(row, 5, TABLE, "story_brief")?,
        status_summary: row_helpers::get_opt(row, 6, TABLE, "status_summary")?,
        location: row_helpers::get_opt(row, 7, TABLE, "status_location")?,
        in_combat: in_combat != 0,
        character_sheet: row_helpers::get_opt(row, 9, TABLE, "character_sheet")?,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, TABLE, "updated_at")?,
        archived_at: archived_at
            .map(|raw| row_helpers::parse_timestamp(&raw, TABLE, "archived_at"))
            .transpose()?,
    })
}
