use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_AUTOBACKUP_PROP: &str = "autobackup:{name}";
pub const AUTOBACKUP_PROGRAM: &str = "zfs-autobackup";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScheduleMode {
    And,
    #[default]
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value")]
pub enum Trigger {
    Cron(String),
    /// `weeks:days:hours:minutes:seconds`
    Interval(String),
}

impl Trigger {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Trigger::Cron(expr) => {
                let fields: Vec<&str> = expr.split_whitespace().collect();
                if fields.len() != 5 {
                    return Err(format!("cron expression needs 5 fields: {expr}"));
                }
                let allowed = |c: char| c.is_ascii_alphanumeric() || "*/,-?".contains(c);
                if fields.iter().any(|field| !field.chars().all(allowed)) {
                    return Err(format!("invalid cron expression: {expr}"));
                }
                Ok(())
            }
            Trigger::Interval(value) => parse_interval(value).map(|_| ()),
        }
    }
}

/// Parses `w:d:h:m:s`; every field must be present and decimal.
pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let fields: Vec<&str> = value.split(':').collect();
    if fields.len() != 5 {
        return Err(format!("interval needs 5 fields: {value}"));
    }
    let mut parsed = [0u64; 5];
    for (slot, field) in parsed.iter_mut().zip(&fields) {
        if field.is_empty() || !field.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid interval field {field:?} in {value}"));
        }
        *slot = field
            .parse::<u64>()
            .map_err(|err| format!("invalid interval field {field:?}: {err}"))?;
    }
    let [weeks, days, hours, minutes, seconds] = parsed;
    let total = weeks * 7 * 86_400 + days * 86_400 + hours * 3_600 + minutes * 60 + seconds;
    Ok(Duration::from_secs(total))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FsRole {
    /// Dataset and all of its children.
    Full,
    Parent,
    Child,
    Exclude,
}

impl FsRole {
    /// Value written to the selection property.
    pub fn prop_value(&self) -> &'static str {
        match self {
            FsRole::Full => "true",
            FsRole::Parent => "parent",
            FsRole::Child => "child",
            FsRole::Exclude => "false",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutobackupSpec {
    #[serde(default = "default_prop")]
    pub prop: String,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub filesystems: BTreeMap<String, FsRole>,
}

fn default_prop() -> String {
    DEFAULT_AUTOBACKUP_PROP.to_string()
}

impl AutobackupSpec {
    /// Renders the backup invocation for a job named `name`.
    pub fn command(&self, name: &str, host: &str) -> String {
        let mut command = AUTOBACKUP_PROGRAM.to_string();
        for (key, value) in &self.options {
            command.push_str(" --");
            command.push_str(key);
            if !value.is_empty() {
                command.push(' ');
                command.push_str(value);
            }
        }
        let prop = render_template(&self.prop, name, host);
        let suffix = prop.split_once(':').map(|(_, suffix)| suffix).unwrap_or("");
        command.push(' ');
        command.push_str(suffix);
        if !self.target_path.is_empty() {
            command.push(' ');
            command.push_str(&self.target_path);
        }
        command
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "app", rename_all = "snake_case")]
pub enum JobKind {
    ZfsAutobackup(AutobackupSpec),
    Remote { hosts: Vec<String> },
    Local,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::ZfsAutobackup(_) => "zfs_autobackup",
            JobKind::Remote { .. } => "remote",
            JobKind::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub host: String,
    pub command: String,
    #[serde(flatten)]
    pub kind: JobKind,
    #[serde(default)]
    pub schedule_mode: ScheduleMode,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub pipe_success: bool,
    #[serde(default)]
    pub pipe_error: bool,
    #[serde(default)]
    pub next_run: Option<f64>,
    pub timestamp: f64,
}

impl Job {
    pub fn job_id(name: &str, host: &str) -> String {
        format!("{name}@{host}")
    }

    pub fn rendered_command(&self) -> String {
        render_template(&self.command, &self.name, &self.host)
    }
}

/// Substitutes `{name}` and `{host}`; other text passes through untouched.
pub fn render_template(template: &str, name: &str, host: &str) -> String {
    template.replace("{name}", name).replace("{host}", host)
}
