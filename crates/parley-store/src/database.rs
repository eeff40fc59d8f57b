//! The SQLite connection behind the signaling channel. Opening always
//! migrates first.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use parley_shared::constants::APP_NAME;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// `parley.db` in the platform data directory, e.g.
    /// `~/.local/share/parley/parley.db` on Linux.
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("org", APP_NAME, APP_NAME).ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join(format!("{APP_NAME}.db")))
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// Records are shared with every connection to the file. Watches only
    /// see writes made through the same [`SqliteChannel`](crate::SqliteChannel).
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::prepare(conn)
    }

    /// Open a private in-memory database. Used by tests and single-process demos.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// `None` for in-memory databases.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
