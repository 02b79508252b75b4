//! SQLite-backed store shared by every rffmpeg process on the machine.
//!
//! Each dispatcher is its own OS process, so all coordination goes through
//! this database. The connection mutex is only held for a single statement or
//! a single short read transaction, never while a child is running.

use crate::model::{Host, HostFilter, HostState, Process, Snapshot, State};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Schema versions, applied in order and tracked in `PRAGMA user_version`
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      servername TEXT NOT NULL UNIQUE,
      hostname TEXT NOT NULL,
      weight INTEGER NOT NULL DEFAULT 1 CHECK(weight > 0),
      created_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS processes (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      host_id INTEGER NOT NULL,
      process_id INTEGER NOT NULL,
      cmd TEXT NOT NULL,
      created_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_processes_host ON processes(host_id);

    CREATE TABLE IF NOT EXISTS states (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      host_id INTEGER NOT NULL,
      state TEXT NOT NULL CHECK(state IN ('idle', 'fallback', 'dead')),
      created_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_states_host_created ON states(host_id, created_at_ms);
    "#,
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A uniqueness constraint rejected the write
    #[error("unique constraint violated")]
    Conflict,

    #[error("invalid row: {0}")]
    InvalidRow(&'static str),
}

fn map_insert_conflict(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict
        }
        other => StoreError::Sql(other),
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    let weight: i64 = row.get(3)?;
    Ok(Host {
        id: row.get(0)?,
        servername: row.get(1)?,
        hostname: row.get(2)?,
        weight: u32::try_from(weight)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, weight))?,
        created: from_ms(row.get(4)?, 4)?,
    })
}

fn process_from_row(row: &Row<'_>) -> rusqlite::Result<Process> {
    let pid: i64 = row.get(2)?;
    Ok(Process {
        id: row.get(0)?,
        host_id: row.get(1)?,
        process_id: u32::try_from(pid)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(2, pid))?,
        cmd: row.get(3)?,
        created: from_ms(row.get(4)?, 4)?,
    })
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<State> {
    Ok(State {
        id: row.get(0)?,
        host_id: row.get(1)?,
        state: row.get(2)?,
        created: from_ms(row.get(3)?, 3)?,
    })
}

const HOST_COLUMNS: &str = "id, servername, hostname, weight, created_at_ms";
const PROCESS_COLUMNS: &str = "id, host_id, process_id, cmd, created_at_ms";
const STATE_COLUMNS: &str = "id, host_id, state, created_at_ms";

fn query_hosts(conn: &Connection) -> rusqlite::Result<Vec<Host>> {
    let mut stmt = conn.prepare(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY id ASC"))?;
    let rows = stmt.query_map([], host_from_row)?;
    rows.collect()
}

fn query_processes(conn: &Connection) -> rusqlite::Result<Vec<Process>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROCESS_COLUMNS} FROM processes ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([], process_from_row)?;
    rows.collect()
}

fn query_states(conn: &Connection) -> rusqlite::Result<Vec<State>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STATE_COLUMNS} FROM states ORDER BY created_at_ms DESC, id DESC"
    ))?;
    let rows = stmt.query_map([], state_from_row)?;
    rows.collect()
}

/// Apply every migration newer than the database's `user_version`
fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    for (index, sql) in MIGRATIONS.iter().enumerate() {
        let version = index as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        debug!(version, "applied schema migration");
    }
    Ok(())
}

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and migrate it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        migrate(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic mid-statement leaves nothing half-applied in SQLite
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// SQLite library version
    pub fn version(&self) -> Result<String, StoreError> {
        let conn = self.conn();
        let version = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Current schema version
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let version = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    pub fn insert_host(
        &self,
        servername: &str,
        hostname: &str,
        weight: u32,
        created: DateTime<Utc>,
    ) -> Result<Host, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO hosts(servername, hostname, weight, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![servername, hostname, weight, to_ms(created)],
        )
        .map_err(map_insert_conflict)?;

        Ok(Host {
            id: conn.last_insert_rowid(),
            servername: servername.to_string(),
            hostname: hostname.to_string(),
            weight,
            created: DateTime::from_timestamp_millis(to_ms(created))
                .ok_or(StoreError::InvalidRow("created"))?,
        })
    }

    /// Returns the number of rows removed
    pub fn delete_host(&self, id: i64) -> Result<usize, StoreError> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM hosts WHERE id = ?1", params![id])?)
    }

    /// All hosts in insertion order
    pub fn hosts(&self) -> Result<Vec<Host>, StoreError> {
        let conn = self.conn();
        Ok(query_hosts(&conn)?)
    }

    pub fn hosts_by(&self, filter: &HostFilter) -> Result<Vec<Host>, StoreError> {
        let conn = self.conn();
        let (column, value): (&str, &dyn rusqlite::ToSql) = match filter {
            HostFilter::Id(id) => ("id", id),
            HostFilter::Servername(name) => ("servername", name),
            HostFilter::Hostname(name) => ("hostname", name),
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE {column} = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([value], host_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_process(
        &self,
        host_id: i64,
        process_id: u32,
        cmd: &str,
        created: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO processes(host_id, process_id, cmd, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![host_id, process_id, cmd, to_ms(created)],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.process(id)?.ok_or(StoreError::InvalidRow("process vanished after insert"))
    }

    pub fn process(&self, id: i64) -> Result<Option<Process>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROCESS_COLUMNS} FROM processes WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], process_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Returns the number of rows removed
    pub fn delete_process(&self, id: i64) -> Result<usize, StoreError> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM processes WHERE id = ?1", params![id])?)
    }

    pub fn processes(&self) -> Result<Vec<Process>, StoreError> {
        let conn = self.conn();
        Ok(query_processes(&conn)?)
    }

    pub fn processes_for_host(&self, host_id: i64) -> Result<Vec<Process>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROCESS_COLUMNS} FROM processes WHERE host_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![host_id], process_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete process rows, all of them or only those of `host_id`
    pub fn delete_processes(&self, host_id: Option<i64>) -> Result<usize, StoreError> {
        let conn = self.conn();
        let removed = match host_id {
            Some(id) => conn.execute("DELETE FROM processes WHERE host_id = ?1", params![id])?,
            None => conn.execute("DELETE FROM processes", [])?,
        };
        Ok(removed)
    }

    pub fn insert_state(
        &self,
        host_id: i64,
        state: HostState,
        created: DateTime<Utc>,
    ) -> Result<State, StoreError> {
        let conn = self.conn();
        let created_ms = to_ms(created);
        conn.execute(
            "INSERT INTO states(host_id, state, created_at_ms) VALUES (?1, ?2, ?3)",
            params![host_id, state, created_ms],
        )?;

        Ok(State {
            id: conn.last_insert_rowid(),
            host_id,
            state,
            created: DateTime::from_timestamp_millis(created_ms)
                .ok_or(StoreError::InvalidRow("created"))?,
        })
    }

    /// All state rows, most recent first
    pub fn states(&self) -> Result<Vec<State>, StoreError> {
        let conn = self.conn();
        Ok(query_states(&conn)?)
    }

    /// State rows of one host, most recent first
    pub fn states_for_host(&self, host_id: i64) -> Result<Vec<State>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM states WHERE host_id = ?1 \
             ORDER BY created_at_ms DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![host_id], state_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete state rows, all of them or only those of `host_id`
    pub fn delete_states(&self, host_id: Option<i64>) -> Result<usize, StoreError> {
        let conn = self.conn();
        let removed = match host_id {
            Some(id) => conn.execute("DELETE FROM states WHERE host_id = ?1", params![id])?,
            None => conn.execute("DELETE FROM states", [])?,
        };
        Ok(removed)
    }

    /// Hosts, processes and states read inside one transaction
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let snapshot = Snapshot {
            hosts: query_hosts(&tx)?,
            processes: query_processes(&tx)?,
            states: query_states(&tx)?,
        };
        tx.commit()?;
        Ok(snapshot)
    }
}
