//! Batched snapshot commands awaiting manual or automatic execution.

use std::sync::{Mutex, MutexGuard};

use protocol::{epoch_micros, CommandResult, ResultStatus, Task, TaskAction, TaskStatus};
use zfs::{Execute, Zfs};

use crate::history::History;

/// Why [`TaskQueue::run`] did not execute a task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunRefusal {
    Missing,
    NotPending(TaskStatus),
    /// The host's connection is running something else.
    Busy,
}

#[derive(Default)]
struct Queue {
    tasks: Vec<Task>,
    last_timestamp: u64,
}

#[derive(Default)]
pub(crate) struct TaskQueue {
    inner: Mutex<Queue>,
}

impl TaskQueue {
    /// One pending task per host; timestamps are unique within the queue.
    pub(crate) fn enqueue(&self, action: TaskAction, command: &str, hosts: &[String]) -> Vec<Task> {
        let mut queue = self.lock();
        let mut created = Vec::with_capacity(hosts.len());
        for host in hosts {
            let timestamp = epoch_micros().max(queue.last_timestamp + 1);
            queue.last_timestamp = timestamp;
            let task = Task::pending(action, command, host.as_str(), timestamp);
            queue.tasks.push(task.clone());
            created.push(task);
        }
        tracing::info!(
            event = "task.enqueue",
            command = %command,
            hosts = hosts.len(),
            "tasks queued"
        );
        created
    }

    pub(crate) fn list(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub(crate) fn get(&self, timestamp: u64) -> Option<Task> {
        self.lock()
            .tasks
            .iter()
            .find(|task| task.timestamp == timestamp)
            .cloned()
    }

    /// Pending tasks that `apply` would run, without running them.
    pub(crate) fn dry_run(&self) -> Vec<Task> {
        self.lock()
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    pub(crate) fn remove(&self, timestamp: u64) -> Option<Task> {
        let mut queue = self.lock();
        let index = queue
            .tasks
            .iter()
            .position(|task| task.timestamp == timestamp)?;
        Some(queue.tasks.remove(index))
    }

    /// Puts failed tasks back to pending so they can be retried.
    pub(crate) fn reset(&self, timestamps: &[u64]) -> Vec<Task> {
        let mut queue = self.lock();
        let mut reset = Vec::new();
        for task in queue
            .tasks
            .iter_mut()
            .filter(|task| timestamps.contains(&task.timestamp))
            .filter(|task| task.status == TaskStatus::Error)
        {
            task.status = TaskStatus::Pending;
            task.result = None;
            reset.push(task.clone());
        }
        reset
    }

    /// Runs a pending task on `connection`. Output on either stream marks
    /// the task failed; a clean run removes it from the queue and
    /// invalidates the connection's query cache.
    pub(crate) async fn run<E: Execute>(
        &self,
        timestamp: u64,
        connection: &Zfs<E>,
        history: &History,
    ) -> Result<Task, RunRefusal> {
        let command = {
            let mut queue = self.lock();
            let task = queue
                .tasks
                .iter_mut()
                .find(|task| task.timestamp == timestamp)
                .ok_or(RunRefusal::Missing)?;
            if task.status != TaskStatus::Pending {
                return Err(RunRefusal::NotPending(task.status));
            }
            if connection.is_busy() {
                tracing::warn!(
                    event = "task.skip",
                    host = %task.host,
                    command = %task.command,
                    "connection busy, task left pending"
                );
                return Err(RunRefusal::Busy);
            }
            task.status = TaskStatus::Running;
            task.command.clone()
        };

        let mut result = connection.execute(&command).await;
        if runner::is_busy_skip(&result) {
            // another caller took the connection after the check above
            self.set_status(timestamp, TaskStatus::Pending);
            tracing::warn!(
                event = "task.skip",
                host = %result.name,
                command = %command,
                "connection busy, task left pending"
            );
            return Err(RunRefusal::Busy);
        }
        let status = classify(&result);
        result.status = match status {
            TaskStatus::Success => ResultStatus::Success,
            _ => ResultStatus::Error,
        };
        history.push(result.clone());
        if status == TaskStatus::Success {
            connection.invalidate(None);
        }
        Ok(self.finish(timestamp, status, result))
    }

    fn set_status(&self, timestamp: u64, status: TaskStatus) {
        let mut queue = self.lock();
        if let Some(task) = queue
            .tasks
            .iter_mut()
            .find(|task| task.timestamp == timestamp)
        {
            task.status = status;
        }
    }

    /// Records an outcome for a task that could not be executed at all.
    pub(crate) fn fail(&self, timestamp: u64, trace: &str) -> Option<Task> {
        let mut queue = self.lock();
        let task = queue
            .tasks
            .iter_mut()
            .find(|task| task.timestamp == timestamp)?;
        let mut result = CommandResult::new(task.command.clone());
        result.name = task.host.clone();
        result.return_code = None;
        result.status = ResultStatus::Error;
        result.trace = trace.to_string();
        task.status = TaskStatus::Error;
        task.result = Some(result);
        Some(task.clone())
    }

    fn finish(&self, timestamp: u64, status: TaskStatus, result: CommandResult) -> Task {
        let mut queue = self.lock();
        let position = queue
            .tasks
            .iter()
            .position(|task| task.timestamp == timestamp);
        match position {
            Some(index) => {
                let task = &mut queue.tasks[index];
                task.status = status;
                task.result = Some(result);
                let finished = task.clone();
                if status == TaskStatus::Success {
                    queue.tasks.remove(index);
                }
                finished
            }
            // discarded while running
            None => Task {
                action: TaskAction::Custom,
                command: result.command.clone(),
                host: result.name.clone(),
                status,
                result: Some(result),
                timestamp,
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn classify(result: &CommandResult) -> TaskStatus {
    if result.failed() || !result.stdout().is_empty() || !result.stderr().is_empty() {
        TaskStatus::Error
    } else {
        TaskStatus::Success
    }
}
