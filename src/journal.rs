//! Operational journal (optional, §10.5): records per-file processing
//! outcomes in a local SQLite database for operator visibility. Not required
//! for correctness — the orchestrator's in-memory job table is authoritative
//! for the running process; this is a durable trail across restarts.
//!
//! WAL mode, busy timeout, tables created on open.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;

pub struct Journal {
    conn: Connection,
}

impl Journal {
    /// Open (or create) the journal database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating journal directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening journal DB: {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS file_outcomes (
                 path TEXT PRIMARY KEY,
                 state TEXT NOT NULL,
                 records_processed INTEGER NOT NULL DEFAULT 0,
                 records_invalid INTEGER NOT NULL DEFAULT 0,
                 last_error TEXT,
                 updated_at TEXT NOT NULL
             );",
        )
        .context("initialising journal schema")?;

        tracing::debug!(path = %path.display(), "opened operational journal");
        Ok(Self { conn })
    }

    pub fn open_default(base_dir: &Path) -> Result<Self> {
        Self::open(&base_dir.join("edge-log-agent-journal.db"))
    }

    /// Record (or overwrite) the outcome for one file. Best-effort: callers
    /// log on error rather than treat journal writes as fatal.
    pub fn record_outcome(
        &self,
        file_path: &Path,
        state: &str,
        records_processed: u64,
        records_invalid: u64,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO file_outcomes (path, state, records_processed, records_invalid, last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(path) DO UPDATE SET
                     state = excluded.state,
                     records_processed = excluded.records_processed,
                     records_invalid = excluded.records_invalid,
                     last_error = excluded.last_error,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    file_path.to_string_lossy(),
                    state,
                    records_processed,
                    records_invalid,
                    last_error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("writing file outcome")?;
        Ok(())
    }

    pub fn outcome_state(&self, file_path: &Path) -> Result<Option<String>> {
        let result = self.conn.query_row(
            "SELECT state FROM file_outcomes WHERE path = ?1",
            [file_path.to_string_lossy()],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("reading file outcome"),
        }
    }

    /// Count of files currently in each recorded state, for the health
    /// snapshot / CLI status output.
    pub fn state_counts(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM file_outcomes GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

pub fn default_path(base_dir: &Path) -> PathBuf {
    base_dir.join("edge-log-agent-journal.db")
}
