use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use protocol::{CommandResult, ResultStatus};
use zfs::Execute;

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("{prefix}-{nanos}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[derive(Clone, Default)]
pub(crate) struct Reply {
    pub(crate) stdout: Vec<String>,
    pub(crate) stderr: Vec<String>,
    pub(crate) return_code: i32,
}

/// Answers known commands with canned output and records every call.
pub(crate) struct ScriptedExecutor {
    name: String,
    replies: HashMap<String, Reply>,
    calls: Mutex<Vec<String>>,
    busy: AtomicBool,
    refuse_next: AtomicBool,
}

impl ScriptedExecutor {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
            refuse_next: AtomicBool::new(false),
        }
    }

    pub(crate) fn reply(mut self, command: &str, reply: Reply) -> Self {
        self.replies.insert(command.to_string(), reply);
        self
    }

    pub(crate) fn stdout(self, command: &str, lines: &[&str]) -> Self {
        self.reply(
            command,
            Reply {
                stdout: lines.iter().map(|line| line.to_string()).collect(),
                ..Reply::default()
            },
        )
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// The next run answers like a `Cli` that another caller just claimed,
    /// while `is_busy` still reports idle.
    pub(crate) fn refuse_next_run(&self) {
        self.refuse_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Execute for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    async fn execute(&self, command: &str, _max_output_lines: usize) -> CommandResult {
        if self.refuse_next.swap(false, Ordering::SeqCst) {
            let mut refused = CommandResult::new(command);
            refused.name = self.name.clone();
            refused.return_code = None;
            refused.status = ResultStatus::Error;
            refused.trace = runner::BUSY_TRACE.to_string();
            return refused;
        }
        self.calls.lock().unwrap().push(command.to_string());
        let reply = self.replies.get(command).cloned().unwrap_or_default();
        let mut result = CommandResult::new(command);
        result.name = self.name.clone();
        result.return_code = Some(reply.return_code);
        result.stdout_lines = reply.stdout;
        result.stderr_lines = reply.stderr;
        result
    }
}
