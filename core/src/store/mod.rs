//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Stages and the engine call store methods; they never execute SQL directly.
//!
//! Layers:
//!   - silver: cleaned per-source records (silver.rs)
//!   - gold:   merged table and analytical outputs (gold.rs)

use crate::{error::PipelineResult, event::EventLogEntry, types::Timestamp};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
mod gold;
mod silver;

/// Stored timestamps keep sub-second precision so they round-trip exactly.
const STORED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub struct PipelineStore {
    conn: Connection,
}

impl PipelineStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn
            .execute_batch(include_str!("../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../migrations/002_silver.sql"))?;
        self.conn
            .execute_batch(include_str!("../../migrations/003_gold.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, seed: u64, version: &str) -> PipelineResult<()> {
        let started_at = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO run (run_id, seed, version, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, seed as i64, version, started_at],
        )?;
        Ok(())
    }

    pub fn run_seed(&self, run_id: &str) -> PipelineResult<Option<u64>> {
        let seed = self
            .conn
            .query_row(
                "SELECT seed FROM run WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(seed.map(|s| s as u64))
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, seq, stage, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id,
                entry.seq as i64,
                entry.stage,
                entry.event_type,
                entry.payload,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> PipelineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, seq, stage, event_type, payload
             FROM event_log WHERE run_id = ?1
             ORDER BY seq ASC, id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    seq: row.get::<_, i64>(2)? as u64,
                    stage: row.get(3)?,
                    event_type: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ── Stage reports ──────────────────────────────────────────

    pub fn save_stage_report(&self, run_id: &str, stage: &str, report_json: &str) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO stage_report (run_id, stage, report_json) VALUES (?1, ?2, ?3)",
            params![run_id, stage, report_json],
        )?;
        Ok(())
    }

    pub fn stage_report(&self, run_id: &str, stage: &str) -> PipelineResult<Option<String>> {
        let json = self
            .conn
            .query_row(
                "SELECT report_json FROM stage_report WHERE run_id = ?1 AND stage = ?2",
                params![run_id, stage],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json)
    }

    fn count_rows(&self, table: &str, run_id: &str) -> PipelineResult<usize> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE run_id = ?1"),
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(STORED_TIMESTAMP_FORMAT).to_string()
}

/// Read a stored timestamp column inside a rusqlite row mapper.
fn read_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let text: String = row.get(idx)?;
    Timestamp::parse_from_str(&text, STORED_TIMESTAMP_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
