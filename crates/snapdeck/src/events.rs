use protocol::Task;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum SnapdeckEvent {
    HostsChanged { hosts: Vec<String> },
    TaskUpdated { task: Task },
    TaskRemoved { timestamp: u64 },
    /// A command finished and was appended to the history.
    ResultRecorded { result: Value },
    /// A command produced stderr; shown to the operator as a warning.
    Warning { host: String, message: String },
}
