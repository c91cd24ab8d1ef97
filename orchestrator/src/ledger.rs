//! Rank Ledger: per-mode win/loss counters.
//!
//! Writes go to SQLite (WAL) when a path is configured, otherwise they only
//! live in memory. Either way, reads are served from a cache that is updated
//! after each successful write, so [LedgerReader] handles can be shared with
//! code outside the engine task without touching the database.

use rusqlite::{params, Connection};
use serde::Serialize;
use skirmish_types::Mode;
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown mode in ledger: {0}")]
    UnknownMode(String),
    #[cfg(test)]
    #[error("injected write failure")]
    Injected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RankRecord {
    pub wins: u64,
    pub losses: u64,
}

type Cache = Arc<RwLock<HashMap<Mode, RankRecord>>>;

enum Backend {
    Memory,
    Sqlite(Connection),
}

pub struct RankLedger {
    backend: Backend,
    cache: Cache,
    #[cfg(test)]
    fail_writes: usize,
}

/// Cloneable read-only view of the ledger.
#[derive(Clone)]
pub struct LedgerReader {
    cache: Cache,
}

impl LedgerReader {
    pub fn record(&self, mode: Mode) -> RankRecord {
        read(&self.cache, mode)
    }
}

fn read(cache: &Cache, mode: Mode) -> RankRecord {
    cache
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&mode)
        .copied()
        .unwrap_or_default()
}

fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         CREATE TABLE IF NOT EXISTS rank_records (
             mode TEXT PRIMARY KEY,
             wins INTEGER NOT NULL DEFAULT 0,
             losses INTEGER NOT NULL DEFAULT 0
         );",
    )?;
    Ok(())
}

fn load(conn: &Connection) -> Result<HashMap<Mode, RankRecord>, LedgerError> {
    let mut stmt = conn.prepare("SELECT mode, wins, losses FROM rank_records")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut records = HashMap::new();
    for row in rows {
        let (mode, wins, losses) = row?;
        let mode = mode
            .parse::<Mode>()
            .map_err(|_| LedgerError::UnknownMode(mode.clone()))?;
        records.insert(
            mode,
            RankRecord {
                wins: wins.max(0) as u64,
                losses: losses.max(0) as u64,
            },
        );
    }
    Ok(records)
}

impl RankLedger {
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::Memory, HashMap::new())
    }

    /// Open (or create) a ledger database and load its records.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        let records = load(&conn)?;
        info!(path = %path.display(), modes = records.len(), "opened rank ledger");
        Ok(Self::with_backend(Backend::Sqlite(conn), records))
    }

    fn with_backend(backend: Backend, records: HashMap<Mode, RankRecord>) -> Self {
        Self {
            backend,
            cache: Arc::new(RwLock::new(records)),
            #[cfg(test)]
            fail_writes: 0,
        }
    }

    pub fn reader(&self) -> LedgerReader {
        LedgerReader {
            cache: self.cache.clone(),
        }
    }

    /// Last successfully written record for `mode`.
    pub fn record(&self, mode: Mode) -> RankRecord {
        read(&self.cache, mode)
    }

    /// Count one finished match. Durable before it returns `Ok`; on `Err`
    /// nothing was counted.
    pub fn record_result(&mut self, mode: Mode, won: bool) -> Result<RankRecord, LedgerError> {
        #[cfg(test)]
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(LedgerError::Injected);
        }

        let (wins, losses) = if won { (1i64, 0i64) } else { (0, 1) };
        let record = match &self.backend {
            Backend::Memory => {
                let current = self.record(mode);
                RankRecord {
                    wins: current.wins + wins as u64,
                    losses: current.losses + losses as u64,
                }
            }
            Backend::Sqlite(conn) => {
                let (wins, losses) = conn.query_row(
                    "INSERT INTO rank_records (mode, wins, losses) VALUES (?1, ?2, ?3)
                     ON CONFLICT(mode) DO UPDATE SET
                         wins = wins + excluded.wins,
                         losses = losses + excluded.losses
                     RETURNING wins, losses",
                    params![mode.as_str(), wins, losses],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?;
                RankRecord {
                    wins: wins.max(0) as u64,
                    losses: losses.max(0) as u64,
                }
            }
        };

        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(mode, record);
        debug!(%mode, won, wins = record.wins, losses = record.losses, "recorded result");
        Ok(record)
    }

    /// Make the next `count` writes fail without counting anything.
    #[cfg(test)]
    pub(crate) fn fail_next_writes(&mut self, count: usize) {
        self.fail_writes = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn in_memory_counts_per_mode() {
        let mut ledger = RankLedger::in_memory();
        let reader = ledger.reader();
        ledger.record_result(Mode::Duel, true).unwrap();
        ledger.record_result(Mode::Duel, false).unwrap();
        let record = ledger.record_result(Mode::Duel, true).unwrap();
        assert_eq!(record, RankRecord { wins: 2, losses: 1 });
        assert_eq!(reader.record(Mode::Duel), record);
        assert_eq!(reader.record(Mode::Team3), RankRecord::default());
    }

    #[test]
    fn sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let mut ledger = RankLedger::open(&path).unwrap();
            ledger.record_result(Mode::Duel, true).unwrap();
            ledger.record_result(Mode::BattleRoyale10, false).unwrap();
            ledger.record_result(Mode::Duel, true).unwrap();
        }

        let mut ledger = RankLedger::open(&path).unwrap();
        assert_eq!(ledger.record(Mode::Duel), RankRecord { wins: 2, losses: 0 });
        assert_eq!(
            ledger.record(Mode::BattleRoyale10),
            RankRecord { wins: 0, losses: 1 }
        );
        let record = ledger.record_result(Mode::Duel, false).unwrap();
        assert_eq!(record, RankRecord { wins: 2, losses: 1 });
    }

    #[test]
    fn failed_write_counts_nothing() {
        let mut ledger = RankLedger::in_memory();
        ledger.fail_next_writes(1);
        assert!(ledger.record_result(Mode::Duel, true).is_err());
        assert_eq!(ledger.record(Mode::Duel), RankRecord::default());
        ledger.record_result(Mode::Duel, true).unwrap();
        assert_eq!(ledger.record(Mode::Duel).wins, 1);
    }

    #[test]
    fn rejects_unknown_mode_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let conn = Connection::open(&path).unwrap();
            init_schema(&conn).unwrap();
            conn.execute(
                "INSERT INTO rank_records (mode, wins, losses) VALUES ('tag', 1, 0)",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            RankLedger::open(&path),
            Err(LedgerError::UnknownMode(mode)) if mode == "tag"
        ));
    }
}
