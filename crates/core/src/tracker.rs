//! Process and state bookkeeping
//!
//! A process row lives exactly as long as its child: it is inserted once the
//! child's PID is known and removed by [`ProcessGuard`] on every exit path,
//! including early returns and unwinding. State rows are append-only evidence
//! of dispatch outcomes.

use crate::model::{HostState, Process, State};
use crate::selector::Target;
use crate::store::{Store, StoreError};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for tracker operations
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("process row not found: {0}")]
    NotFound(i64),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Rows removed by an administrative clear
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearSummary {
    pub processes: usize,
    pub states: usize,
}

#[derive(Clone, Copy)]
pub struct Tracker<'a> {
    store: &'a Store,
}

impl<'a> Tracker<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert the process row for a child that has just been spawned
    pub fn begin_process(
        &self,
        target: &Target,
        pid: u32,
        cmd: &str,
    ) -> Result<ProcessGuard<'a>, TrackerError> {
        let row = self
            .store
            .insert_process(target.host_id(), pid, cmd, Utc::now())?;
        debug!(row = row.id, host_id = row.host_id, pid, "began process");
        Ok(ProcessGuard {
            tracker: *self,
            row,
            ended: false,
        })
    }

    /// Delete a process row
    pub fn end_process(&self, row_id: i64) -> Result<(), TrackerError> {
        match self.store.delete_process(row_id)? {
            0 => Err(TrackerError::NotFound(row_id)),
            _ => {
                debug!(row = row_id, "ended process");
                Ok(())
            }
        }
    }

    /// Append a state row for `host_id`
    pub fn record_state(&self, host_id: i64, state: HostState) -> Result<State, TrackerError> {
        let row = self.store.insert_state(host_id, state, Utc::now())?;
        info!(host_id, state = %state, "recorded host state");
        Ok(row)
    }

    /// Remove every process and state row
    pub fn clear_all(&self) -> Result<ClearSummary, TrackerError> {
        let summary = ClearSummary {
            processes: self.store.delete_processes(None)?,
            states: self.store.delete_states(None)?,
        };
        info!(processes = summary.processes, states = summary.states, "cleared all rows");
        Ok(summary)
    }

    /// Remove the process and state rows of one host
    pub fn clear_by_host(&self, host_id: i64) -> Result<ClearSummary, TrackerError> {
        let summary = ClearSummary {
            processes: self.store.delete_processes(Some(host_id))?,
            states: self.store.delete_states(Some(host_id))?,
        };
        info!(
            host_id,
            processes = summary.processes,
            states = summary.states,
            "cleared host rows"
        );
        Ok(summary)
    }
}

/// Owns one process row and deletes it when dropped
#[must_use = "dropping the guard ends the process row immediately"]
pub struct ProcessGuard<'a> {
    tracker: Tracker<'a>,
    row: Process,
    ended: bool,
}

impl ProcessGuard<'_> {
    pub fn row(&self) -> &Process {
        &self.row
    }

    /// End the row now and report the outcome
    pub fn end(mut self) -> Result<(), TrackerError> {
        self.ended = true;
        self.tracker.end_process(self.row.id)
    }
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Err(e) = self.tracker.end_process(self.row.id) {
            warn!(row = self.row.id, error = %e, "failed to remove process row");
        }
    }
}
