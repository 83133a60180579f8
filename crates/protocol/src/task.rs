use serde::{Deserialize, Serialize};

use crate::CommandResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Create,
    Destroy,
    Rename,
    Hold,
    Release,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// A queued command for one host. `timestamp` (microseconds since the
/// epoch) identifies the task inside its queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub action: TaskAction,
    pub command: String,
    pub host: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<CommandResult>,
    pub timestamp: u64,
}

impl Task {
    pub fn pending(
        action: TaskAction,
        command: impl Into<String>,
        host: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            action,
            command: command.into(),
            host: host.into(),
            status: TaskStatus::Pending,
            result: None,
            timestamp,
        }
    }
}
