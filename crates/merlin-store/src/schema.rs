/// SQL DDL for the merlin-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS chat_sessions (
    session_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    character_id TEXT NOT NULL,
    character_name TEXT,
    title TEXT NOT NULL,
    story_brief TEXT,
    status_summary TEXT,
    status_location TEXT,
    in_combat INTEGER NOT NULL DEFAULT 0,
    character_sheet TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    archived_at TEXT
);

CREATE TABLE IF NOT EXISTS chat_messages (
    message_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES chat_sessions(session_id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    client_message_id TEXT,
    tokens_in INTEGER,
    tokens_out INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_sessions_owner ON chat_sessions(user_id, character_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_chat_sessions_active
    ON chat_sessions(user_id, character_id) WHERE archived_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, message_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
