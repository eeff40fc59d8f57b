//! Append-only candidate sequences.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::{CallId, CandidateBlob, CandidateItem, CandidateSide};

use crate::calls::timestamp_to_sql;
use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Append `candidate` to one sequence of a call and return its `seq`.
    ///
    /// Fails with [`StoreError::NotFound`](crate::StoreError::NotFound) when
    /// the call does not exist.
    pub fn append_candidate(
        &self,
        call_id: &CallId,
        side: CandidateSide,
        candidate: &CandidateBlob,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        // Existence check gives a typed error instead of a FK violation.
        self.get_call(call_id)?;

        let next: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0)
             FROM call_candidates
             WHERE call_id = ?1 AND side = ?2",
            params![call_id.to_string(), side.as_str()],
            |row| row.get(0),
        )?;

        self.conn().execute(
            "INSERT INTO call_candidates (call_id, side, seq, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                call_id.to_string(),
                side.as_str(),
                next,
                candidate.as_str(),
                timestamp_to_sql(&now),
            ],
        )?;

        Ok(next as u64)
    }

    /// List one sequence in append order.
    pub fn list_candidates(&self, call_id: &CallId, side: CandidateSide) -> Result<Vec<CandidateItem>> {
        let mut stmt = self.conn().prepare(
            "SELECT seq, payload
             FROM call_candidates
             WHERE call_id = ?1 AND side = ?2
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![call_id.to_string(), side.as_str()], |row| {
            let seq: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            Ok(CandidateItem {
                seq: seq as u64,
                candidate: CandidateBlob(payload),
            })
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}
