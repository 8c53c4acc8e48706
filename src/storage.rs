//! Durable event log, snapshots and fill rows over sqlite.
//!
//! The event log is append-only and keyed by a process-wide monotonic
//! `event_id`; on restart the writer resumes at `max(event_id) + 1`.
//! Snapshots upsert by slot. The store is a single-writer capability: the
//! scheduler thread owns it.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub event_id: i64,
    pub slot_id: i64,
    pub from_phase: String,
    pub to_phase: String,
    pub kind: String,
    pub payload: String,
    pub ts: f64,
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub slot_id: i64,
    pub event_id: i64,
    pub state_json: String,
    pub ts: f64,
}

#[derive(Debug, Clone)]
pub struct FillRow {
    pub ts: f64,
    pub slot_id: i64,
    pub trade_id: String,
    pub cycle: u32,
    pub side: String,
    pub price: f64,
    pub volume: f64,
    pub profit: f64,
    pub fees: f64,
}

pub struct Store {
    conn: Connection,
    next_event_id: i64,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self {
            conn,
            next_event_id: 1,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS events (
                event_id INTEGER PRIMARY KEY,
                slot_id INTEGER NOT NULL,
                from_phase TEXT NOT NULL,
                to_phase TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS snapshots (
                slot_id INTEGER PRIMARY KEY,
                event_id INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                ts REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fills (
                ts REAL NOT NULL,
                slot_id INTEGER NOT NULL,
                trade_id TEXT NOT NULL,
                cycle INTEGER NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                volume REAL NOT NULL,
                profit REAL NOT NULL,
                fees REAL NOT NULL
            );
            COMMIT;",
        )?;
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(event_id) FROM events", [], |row| row.get(0))?;
        self.next_event_id = max.unwrap_or(0) + 1;
        Ok(())
    }

    /// Mint the next event id without consuming it.
    pub fn peek_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// Append one event row, consuming the next id. Callers must append
    /// before executing the event's side effects.
    #[allow(clippy::too_many_arguments)]
    pub fn append_event(
        &mut self,
        slot_id: i64,
        from_phase: &str,
        to_phase: &str,
        kind: &str,
        payload: &str,
        ts: f64,
    ) -> Result<i64> {
        let event_id = self.next_event_id;
        self.conn.execute(
            "INSERT INTO events (event_id, slot_id, from_phase, to_phase, kind, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![event_id, slot_id, from_phase, to_phase, kind, payload, ts],
        )?;
        self.next_event_id = event_id + 1;
        Ok(event_id)
    }

    pub fn read_events_since(&self, slot_id: i64, after_event_id: i64) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, slot_id, from_phase, to_phase, kind, payload, ts
             FROM events WHERE slot_id = ?1 AND event_id > ?2 ORDER BY event_id",
        )?;
        let rows = stmt.query_map(params![slot_id, after_event_id], |row| {
            Ok(EventRow {
                event_id: row.get(0)?,
                slot_id: row.get(1)?,
                from_phase: row.get(2)?,
                to_phase: row.get(3)?,
                kind: row.get(4)?,
                payload: row.get(5)?,
                ts: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn put_snapshot(&mut self, slot_id: i64, event_id: i64, state_json: &str, ts: f64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO snapshots (slot_id, event_id, state_json, ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(slot_id) DO UPDATE SET
                 event_id = excluded.event_id,
                 state_json = excluded.state_json,
                 ts = excluded.ts",
            params![slot_id, event_id, state_json, ts],
        )?;
        Ok(())
    }

    pub fn get_snapshot(&self, slot_id: i64) -> Result<Option<SnapshotRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT slot_id, event_id, state_json, ts FROM snapshots WHERE slot_id = ?1",
                params![slot_id],
                |row| {
                    Ok(SnapshotRow {
                        slot_id: row.get(0)?,
                        event_id: row.get(1)?,
                        state_json: row.get(2)?,
                        ts: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn append_fill(&mut self, fill: &FillRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO fills (ts, slot_id, trade_id, cycle, side, price, volume, profit, fees)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                fill.ts,
                fill.slot_id,
                fill.trade_id,
                fill.cycle,
                fill.side,
                fill.price,
                fill.volume,
                fill.profit,
                fill.fees
            ],
        )?;
        Ok(())
    }

    pub fn fill_count(&self, slot_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM fills WHERE slot_id = ?1",
            params![slot_id],
            |row| row.get(0),
        )?)
    }
}
