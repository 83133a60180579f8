use protocol::{CommandResult, ResultStatus};

pub(crate) struct RunOutcome {
    pub(crate) return_code: Option<i32>,
    pub(crate) stdout_lines: Vec<String>,
    pub(crate) stderr_lines: Vec<String>,
    pub(crate) terminated: bool,
    pub(crate) truncated: bool,
}

pub(crate) fn build_result(command: &str, outcome: RunOutcome) -> CommandResult {
    let mut result = CommandResult::new(command);
    result.return_code = outcome.return_code;
    result.stdout_lines = outcome.stdout_lines;
    result.stderr_lines = outcome.stderr_lines;
    result.terminated = outcome.terminated;
    result.truncated = outcome.truncated;
    result
}

/// A run that never produced a process.
pub(crate) fn failed_result(command: &str, trace: impl Into<String>) -> CommandResult {
    let mut result = CommandResult::new(command);
    result.return_code = None;
    result.status = ResultStatus::Error;
    result.trace = trace.into();
    result
}
