//! Status snapshot for the control CLI

use crate::model::{Process, Snapshot, LOCAL_HOST_ID};
use crate::selector::SelectionPolicy;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Servername shown for local fallback processes
pub const FALLBACK_SERVERNAME: &str = "localhost (fallback)";

/// Reported state of one status entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Idle,
    Active,
    Dead,
    Fallback,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Idle => "idle",
            StatusState::Active => "active",
            StatusState::Dead => "dead",
            StatusState::Fallback => "fallback",
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub id: i64,
    pub servername: String,
    pub hostname: String,
    pub weight: u32,
    pub state: StatusState,
    pub processes: Vec<Process>,
}

/// Build the status report from one consistent read of the store
pub fn status_report(
    store: &Store,
    policy: &SelectionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<HostStatus>, StoreError> {
    Ok(report_from_snapshot(&store.snapshot()?, policy, now))
}

fn processes_of(snapshot: &Snapshot, host_id: i64) -> Vec<Process> {
    snapshot
        .processes
        .iter()
        .filter(|p| p.host_id == host_id)
        .cloned()
        .collect()
}

fn report_from_snapshot(
    snapshot: &Snapshot,
    policy: &SelectionPolicy,
    now: DateTime<Utc>,
) -> Vec<HostStatus> {
    let mut report = Vec::with_capacity(snapshot.hosts.len() + 1);

    let local = processes_of(snapshot, LOCAL_HOST_ID);
    if !local.is_empty() {
        report.push(HostStatus {
            id: LOCAL_HOST_ID,
            servername: FALLBACK_SERVERNAME.to_string(),
            hostname: "localhost".to_string(),
            weight: 0,
            state: StatusState::Fallback,
            processes: local,
        });
    }

    for host in &snapshot.hosts {
        let processes = processes_of(snapshot, host.id);
        let state = if policy.is_dead(snapshot, host.id, now) {
            StatusState::Dead
        } else if !processes.is_empty() {
            StatusState::Active
        } else {
            StatusState::Idle
        };
        report.push(HostStatus {
            id: host.id,
            servername: host.servername.clone(),
            hostname: host.hostname.clone(),
            weight: host.weight,
            state,
            processes,
        });
    }

    report
}
