use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Offset, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Starting,
    Running,
    Faulted,
    Stopped,
}

impl TaskState {
    /// Faulted and stopped tasks only run again after an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Faulted | TaskState::Stopped)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            TaskState::Created => "created",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Faulted => "faulted",
            TaskState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Point-in-time view of one ETL task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub last_error: Option<String>,
    pub events_processed: u64,
    pub messages_published: u64,
    pub transform_failures: u64,
    pub last_checkpoint: Option<Offset>,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
}

impl TaskStatus {
    pub fn new(id: TaskId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: TaskState::Created,
            last_error: None,
            events_processed: 0,
            messages_published: 0,
            transform_failures: 0,
            last_checkpoint: None,
            started_at: None,
            restarts: 0,
        }
    }

    /// Status for the next run of the same task. Counters carry over.
    pub fn restarted(&self) -> Self {
        Self {
            state: TaskState::Created,
            last_error: None,
            started_at: None,
            restarts: self.restarts + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_keeps_counters_and_clears_error() {
        let mut status = TaskStatus::new(1, "orders");
        status.state = TaskState::Faulted;
        status.last_error = Some("broker unavailable".to_string());
        status.events_processed = 4;
        status.last_checkpoint = Some(9);

        let next = status.restarted();
        assert_eq!(next.state, TaskState::Created);
        assert_eq!(next.last_error, None);
        assert_eq!(next.events_processed, 4);
        assert_eq!(next.last_checkpoint, Some(9));
        assert_eq!(next.restarts, 1);
        assert!(status.state.is_terminal());
        assert!(!next.state.is_terminal());
    }
}
