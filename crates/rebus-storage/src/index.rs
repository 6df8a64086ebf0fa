// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sqlite companion index for the disk backend.
//!
//! One file per store instance (`diskstorage.sqlite3`) holding the
//! processed tuples and the selector ingestion order. Uniqueness
//! constraints enforce the store invariants at the database level: a
//! `(domain, selector, agent, config)` tuple can be recorded once, and a
//! `(domain, selector)` row exists at most once.

use crate::{NameConfig, StorageError};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS processed(
    domain TEXT, selector TEXT, agent_name TEXT, config TEXT);
CREATE UNIQUE INDEX IF NOT EXISTS no_processed_dups
    ON processed(domain, selector, agent_name, config);
CREATE TABLE IF NOT EXISTS selectors(domain TEXT, selector TEXT);
CREATE UNIQUE INDEX IF NOT EXISTS no_selector_dups
    ON selectors(domain, selector);
";

/// Handle to the relational index.
///
/// The connection is mutex-guarded: the master loop and the checkpoint
/// thread both write to it.
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    /// Open (or create) the index file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(MetadataDb {
            conn: Mutex::new(conn),
        })
    }

    /// Record a processed tuple.
    ///
    /// Returns `true` iff the tuple was not already recorded (the unique
    /// index supplies the answer).
    pub fn add_processed(
        &self,
        domain: &str,
        selector: &str,
        agent_name: &str,
        config: &str,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock().expect("index lock poisoned");
        let outcome = conn.execute(
            "INSERT OR ABORT INTO processed(domain, selector, agent_name, config) \
             VALUES (?1, ?2, ?3, ?4)",
            (domain, selector, agent_name, config),
        );
        match outcome {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record a batch of selector rows (duplicates are ignored).
    pub fn add_selectors(&self, rows: &[(String, String)]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("index lock poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO selectors(domain, selector) VALUES (?1, ?2)",
            )?;
            for (domain, selector) in rows {
                stmt.execute((domain, selector))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All processed tuples, for startup restore.
    pub fn load_processed(&self) -> Result<Vec<(String, String, NameConfig)>, StorageError> {
        let conn = self.conn.lock().expect("index lock poisoned");
        let mut stmt =
            conn.prepare("SELECT domain, selector, agent_name, config FROM processed")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                (row.get::<_, String>(2)?, row.get::<_, String>(3)?),
            ))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Selector rows in ingestion order, for startup restore.
    pub fn load_selectors(&self) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.conn.lock().expect("index lock poisoned");
        let mut stmt =
            conn.prepare("SELECT domain, selector FROM selectors ORDER BY _rowid_")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
