use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{epoch_secs, ResultStatus};

/// Outcome of one executed command.
///
/// `data` carries whatever the caller parsed out of the output. Raw
/// execution results use `serde_json::Value`; the ZFS queries narrow it to
/// their record types with [`CommandResult::with_data`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult<D = Value> {
    pub name: String,
    pub command: String,
    pub return_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub terminated: bool,
    pub truncated: bool,
    pub data: D,
    pub trace: String,
    pub cached: bool,
    pub status: ResultStatus,
    pub timestamp: f64,
}

impl CommandResult<Value> {
    pub fn new(command: impl Into<String>) -> Self {
        Self::with_payload(command, Value::Null)
    }
}

impl<D> CommandResult<D> {
    pub fn with_payload(command: impl Into<String>, data: D) -> Self {
        Self {
            name: String::new(),
            command: command.into(),
            return_code: Some(0),
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            terminated: false,
            truncated: false,
            data,
            trace: String::new(),
            cached: false,
            status: ResultStatus::Success,
            timestamp: epoch_secs(),
        }
    }

    /// A result served from a query cache; nothing was executed.
    pub fn from_cache(data: D) -> Self {
        let mut result = Self::with_payload(String::new(), data);
        result.cached = true;
        result
    }

    pub fn with_data<E>(self, data: E) -> CommandResult<E> {
        CommandResult {
            name: self.name,
            command: self.command,
            return_code: self.return_code,
            stdout_lines: self.stdout_lines,
            stderr_lines: self.stderr_lines,
            terminated: self.terminated,
            truncated: self.truncated,
            data,
            trace: self.trace,
            cached: self.cached,
            status: self.status,
            timestamp: self.timestamp,
        }
    }

    pub fn failed(&self) -> bool {
        self.status != ResultStatus::Success
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.concat()
    }

    pub fn stderr(&self) -> String {
        self.stderr_lines.concat()
    }

    pub fn date(&self) -> String {
        self.format_timestamp("%Y/%m/%d")
    }

    pub fn time(&self) -> String {
        self.format_timestamp("%H:%M:%S")
    }

    fn format_timestamp(&self, pattern: &str) -> String {
        let millis = (self.timestamp * 1000.0) as i64;
        match Local.timestamp_millis_opt(millis).single() {
            Some(datetime) => datetime.format(pattern).to_string(),
            None => String::new(),
        }
    }
}

impl<D: Serialize> CommandResult<D> {
    /// Flat record with the derived fields, used for history and pipes.
    pub fn to_record(&self) -> Value {
        let mut record = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        record.insert("failed".to_string(), Value::Bool(self.failed()));
        record.insert("date".to_string(), Value::String(self.date()));
        record.insert("time".to_string(), Value::String(self.time()));
        record.insert("stdout".to_string(), Value::String(self.stdout()));
        record.insert("stderr".to_string(), Value::String(self.stderr()));
        Value::Object(record)
    }
}
