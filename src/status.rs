// Status Publisher: the pollable view of an orchestration run.
// Writers build a whole new snapshot and swap it in; readers only ever clone an Arc.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use parking_lot::RwLock;
use serde::Serialize;

use crate::transactor::BookingRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl RunState {
    pub fn as_u8(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Running => 1,
            RunState::Stopping => 2,
            RunState::Stopped => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::Stopping,
            3 => RunState::Stopped,
            _ => RunState::Idle,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Stopping)
    }
}

// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    CapReached,
    DailyLimit,
    Cancelled,
    RetriesExhausted,
    // The worker died; last_error carries the cause.
    Aborted,
}

impl RunOutcome {
    pub fn summary(self, booked: usize, retries: u32) -> String {
        match self {
            RunOutcome::CapReached => format!("Completed: booked {booked} window(s)"),
            RunOutcome::DailyLimit => format!(
                "Completed: daily reservation limit reached ({booked} booked this run)"
            ),
            RunOutcome::Cancelled => format!("Stopped by user ({booked} booked)"),
            RunOutcome::RetriesExhausted => {
                format!("Retry limit reached after {retries} cycles ({booked} booked)")
            }
            RunOutcome::Aborted => format!("Run aborted by an internal error ({booked} booked)"),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, RunOutcome::CapReached | RunOutcome::DailyLimit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: RunState,
    pub retry_count: u32,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    // Filled in when the snapshot is handed to a reader
    pub elapsed: String,
    pub booking_records: Vec<BookingRecord>,
    pub last_status_line: String,
    pub last_error: Option<String>,
    pub outcome: Option<RunOutcome>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            retry_count: 0,
            started_at: None,
            finished_at: None,
            elapsed: format_elapsed(Duration::zero()),
            booking_records: Vec::new(),
            last_status_line: "Idle".to_string(),
            last_error: None,
            outcome: None,
        }
    }
}

impl StatusSnapshot {
    pub fn started(now: NaiveDateTime) -> Self {
        Self {
            state: RunState::Running,
            started_at: Some(now),
            last_status_line: "Run started".to_string(),
            ..Default::default()
        }
    }

    // Wall time from start to finish, or to `now` while the run is live
    pub fn elapsed_at(&self, now: NaiveDateTime) -> Duration {
        match self.started_at {
            Some(start) => (self.finished_at.unwrap_or(now) - start).max(Duration::zero()),
            None => Duration::zero(),
        }
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[derive(Debug, Default)]
pub struct StatusPublisher {
    current: RwLock<Arc<StatusSnapshot>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Arc<StatusSnapshot> {
        self.current.read().clone()
    }

    pub fn replace(&self, snapshot: StatusSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    // Copy, edit, swap. Held under the write lock so concurrent writers serialize
    // and readers see either the old or the new snapshot in full.
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut StatusSnapshot),
    {
        let mut current = self.current.write();
        let mut next = StatusSnapshot::clone(&current);
        edit(&mut next);
        *current = Arc::new(next);
    }
}
