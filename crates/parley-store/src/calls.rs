//! CRUD operations for [`CallRecord`] rows.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;

use parley_shared::{
    CallId, CallRecord, CallStatus, CallUpdate, ConversationId, PartyId, SessionDescription,
};

use crate::database::Database;
use crate::error::{Result, StoreError};

const CALL_COLUMNS: &str =
    "id, conversation_id, created_by, status, offer, answer, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a call record as-is.
    pub fn insert_call(&self, call: &CallRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO calls (id, conversation_id, created_by, status, offer, answer, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                call.id.to_string(),
                call.conversation_id.as_str(),
                call.created_by.as_str(),
                call.status.as_str(),
                description_to_sql(call.offer.as_ref())?,
                description_to_sql(call.answer.as_ref())?,
                timestamp_to_sql(&call.created_at),
                timestamp_to_sql(&call.updated_at),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single call by id.
    pub fn get_call(&self, id: &CallId) -> Result<CallRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id.to_string()],
                row_to_call,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List the calls of a conversation whose status is in `statuses`,
    /// oldest first.
    ///
    /// The status set is bound as one JSON array, so the query stays on
    /// `idx_calls_conversation_status` however long the history grows.
    pub fn list_calls(
        &self,
        conversation: &ConversationId,
        statuses: &[CallStatus],
    ) -> Result<Vec<CallRecord>> {
        let wanted = serde_json::to_string(&statuses.iter().map(CallStatus::as_str).collect::<Vec<_>>())?;
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CALL_COLUMNS}
             FROM calls
             WHERE conversation_id = ?1
               AND status IN (SELECT value FROM json_each(?2))
             ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![conversation.as_str(), wanted], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Merge `update` into the stored record at field granularity.
    ///
    /// Columns the update leaves as `None` are never written, so concurrent
    /// updates to disjoint fields do not clobber each other. A status change
    /// the lifecycle forbids rejects the whole update.
    pub fn update_call(
        &self,
        id: &CallId,
        update: &CallUpdate,
        now: DateTime<Utc>,
    ) -> Result<CallRecord> {
        let current = self.get_call(id)?;

        if let Some(next) = update.status {
            if !current.status.can_transition_to(next) {
                return Err(StoreError::IllegalTransition {
                    from: current.status,
                    to: next,
                });
            }
        }

        self.conn().execute(
            "UPDATE calls
             SET status     = COALESCE(?2, status),
                 offer      = COALESCE(?3, offer),
                 answer     = COALESCE(?4, answer),
                 updated_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                update.status.map(|s| s.as_str()),
                description_to_sql(update.offer.as_ref())?,
                description_to_sql(update.answer.as_ref())?,
                timestamp_to_sql(&now),
            ],
        )?;

        self.get_call(id)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so that text order equals chronological order.
pub(crate) fn timestamp_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn conversion_failure<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn description_to_sql(desc: Option<&SessionDescription>) -> Result<Option<String>> {
    desc.map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn description_from_sql(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<SessionDescription>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_failure(idx, e))
}

/// Map a `rusqlite::Row` to a [`CallRecord`].
fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
    let id_str: String = row.get(0)?;
    let conversation: String = row.get(1)?;
    let created_by: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let offer: Option<String> = row.get(4)?;
    let answer: Option<String> = row.get(5)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    let id = CallId::parse(&id_str).map_err(|e| conversion_failure(0, e))?;
    let status = status_str
        .parse::<CallStatus>()
        .map_err(|e| conversion_failure(3, e))?;

    Ok(CallRecord {
        id,
        conversation_id: ConversationId(conversation),
        created_by: PartyId(created_by),
        status,
        offer: description_from_sql(4, offer)?,
        answer: description_from_sql(5, answer)?,
        created_at: timestamp_from_sql(6, &created_str)?,
        updated_at: timestamp_from_sql(7, &updated_str)?,
    })
}
