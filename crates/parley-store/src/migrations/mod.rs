//! Schema migrations, applied in order when a [`Database`](crate::Database)
//! is opened. The schema version lives in `PRAGMA user_version`.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// Every migration with the version it upgrades to. Append only.
const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

/// Schema version after every migration has run.
pub fn latest_version() -> u32 {
    STEPS.last().map(|(version, _, _)| *version).unwrap_or(0)
}

/// Bring the schema up to [`latest_version`].
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > latest_version() {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than this build (v{})",
            latest_version()
        )));
    }

    for (version, name, up) in STEPS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(migration = name, "applying schema migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
