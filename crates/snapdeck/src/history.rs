use std::collections::VecDeque;
use std::sync::Mutex;

use protocol::CommandResult;
use serde_json::Value;

/// Executed results, oldest evicted first once `limit` is reached.
pub(crate) struct History {
    limit: usize,
    entries: Mutex<VecDeque<CommandResult>>,
}

impl History {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, result: CommandResult) {
        let mut entries = self.lock();
        entries.push_back(result);
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    /// Flat records, oldest first.
    pub(crate) fn records(&self) -> Vec<Value> {
        self.lock().iter().map(CommandResult::to_record).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<CommandResult>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let history = History::new(3);
        for index in 0..5 {
            history.push(CommandResult::new(format!("echo {index}")));
        }
        assert_eq!(history.records().len(), 3);
        let commands: Vec<_> = history
            .records()
            .iter()
            .map(|record| record["command"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(commands, vec!["echo 2", "echo 3", "echo 4"]);
    }

    #[test]
    fn records_carry_derived_fields() {
        let history = History::new(10);
        let mut result = CommandResult::new("zfs snapshot  tank@a");
        result.stderr_lines = vec!["dataset does not exist\n".to_string()];
        result.status = protocol::ResultStatus::Error;
        history.push(result);
        let record = &history.records()[0];
        assert_eq!(record["failed"], true);
        assert_eq!(record["status"], "error");
        assert_eq!(record["stderr"], "dataset does not exist\n");
    }
}
