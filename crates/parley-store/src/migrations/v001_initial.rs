//! v001 -- Initial schema creation.
//!
//! Creates the `calls` table and the `call_candidates` table that holds both
//! candidate sequences of every call.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Calls
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    created_by      TEXT NOT NULL,              -- party id of the caller
    status          TEXT NOT NULL,              -- ringing | active | ended | rejected | not-answered
    offer           TEXT,                       -- JSON session description, written once
    answer          TEXT,                       -- JSON session description, written once
    created_at      TEXT NOT NULL,              -- RFC-3339, microseconds, UTC
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_calls_conversation_status
    ON calls(conversation_id, status, created_at);

-- ----------------------------------------------------------------
-- Candidate sequences (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS call_candidates (
    call_id    TEXT NOT NULL,                   -- FK -> calls(id)
    side       TEXT NOT NULL,                   -- offer | answer
    seq        INTEGER NOT NULL,                -- 0-based position within (call_id, side)
    payload    TEXT NOT NULL,                   -- opaque candidate blob
    created_at TEXT NOT NULL,

    PRIMARY KEY (call_id, side, seq),
    FOREIGN KEY (call_id) REFERENCES calls(id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
