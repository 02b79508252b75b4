//! Records persisted by the store.
//!
//! Hosts are registered workers, processes are dispatched invocations that are
//! currently running, and states are an append-only log of dispatch outcomes.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Host id stored in process and state rows that belong to local execution.
/// No host row ever carries this id.
pub const LOCAL_HOST_ID: i64 = 0;

/// A registered worker host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    /// Unique human label
    pub servername: String,
    /// Address handed to the remote shell
    pub hostname: String,
    /// Capacity factor, always >= 1
    pub weight: u32,
    pub created: DateTime<Utc>,
}

/// An invocation that is running right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: i64,
    /// Owning host, [`LOCAL_HOST_ID`] for local execution
    pub host_id: i64,
    /// PID of the local child (remote shell or local binary)
    pub process_id: u32,
    pub cmd: String,
    pub created: DateTime<Utc>,
}

/// Observed outcome of a dispatch attempt.
///
/// `Idle` is never written; it is what a host without state rows reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Idle,
    Fallback,
    Dead,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Idle => "idle",
            HostState::Fallback => "fallback",
            HostState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown host state: {0}")]
pub struct UnknownHostState(pub String);

impl FromStr for HostState {
    type Err = UnknownHostState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(HostState::Idle),
            "fallback" => Ok(HostState::Fallback),
            "dead" => Ok(HostState::Dead),
            other => Err(UnknownHostState(other.to_string())),
        }
    }
}

impl ToSql for HostState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for HostState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One row of the state log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: i64,
    pub host_id: i64,
    pub state: HostState,
    pub created: DateTime<Utc>,
}

/// Filter for host lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFilter {
    Id(i64),
    Servername(String),
    Hostname(String),
}

/// Everything the selector needs, read in one go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Ordered by id
    pub hosts: Vec<Host>,
    pub processes: Vec<Process>,
    /// Most recent first
    pub states: Vec<State>,
}

impl Snapshot {
    /// Number of running processes owned by `host_id`
    pub fn active_process_count(&self, host_id: i64) -> usize {
        self.processes
            .iter()
            .filter(|p| p.host_id == host_id)
            .count()
    }

    /// Most recent state row of `host_id`, if any
    pub fn current_state(&self, host_id: i64) -> Option<&State> {
        self.states.iter().find(|s| s.host_id == host_id)
    }
}
