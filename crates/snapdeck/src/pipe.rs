//! Forwards finished results to an HTTP webhook.

use std::sync::LazyLock;
use std::time::Duration;

use protocol::config::{HttpPipe, PipeTarget};
use protocol::CommandResult;
use regex::{Captures, Regex};
use reqwest::Client;
use serde_json::{Map, Value};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct Pipe {
    config: HttpPipe,
    client: Client,
}

impl Pipe {
    pub(crate) fn new(config: HttpPipe) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "http client setup failed, using defaults");
                Client::new()
            });
        Self { config, client }
    }

    /// The target and rendered body for `result`, if the pipe is enabled
    /// and has a URL for its outcome.
    pub(crate) fn prepare(&self, result: &CommandResult) -> Option<(&PipeTarget, Value)> {
        if !self.config.enable {
            return None;
        }
        let target = if result.failed() {
            &self.config.error
        } else {
            &self.config.success
        };
        if target.url.is_empty() {
            return None;
        }
        let Value::Object(record) = result.to_record() else {
            return None;
        };
        Some((target, render_payload(&target.data, &record)))
    }

    /// Fire and forget; delivery failures are only logged.
    pub(crate) fn send(&self, result: &CommandResult) {
        let Some((target, payload)) = self.prepare(result) else {
            return;
        };
        let mut request = self.client.post(&target.url).json(&payload);
        for (key, value) in &target.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let url = target.url.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(event = "pipe.sent", url = %url, "result piped");
                }
                Ok(response) => {
                    tracing::warn!(
                        event = "pipe.rejected",
                        url = %url,
                        status = %response.status(),
                        "webhook rejected result"
                    );
                }
                Err(err) => {
                    tracing::warn!(event = "pipe.failed", url = %url, error = %err, "webhook unreachable");
                }
            }
        });
    }
}

/// A braced `{field}` or a bare word.
static FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}|[A-Za-z_][A-Za-z0-9_]*").expect("field pattern")
});

/// Copies `template`, replacing result field names found in string values
/// (bare `stdout` or braced `{stdout}`) with that field's text.
pub(crate) fn render_payload(template: &Value, record: &Map<String, Value>) -> Value {
    match template {
        Value::String(text) => Value::String(substitute(text, record)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_payload(item, record))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), render_payload(value, record)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute(text: &str, record: &Map<String, Value>) -> String {
    FIELD
        .replace_all(text, |caps: &Captures| {
            let key = caps.get(1).map_or(&caps[0], |name| name.as_str());
            match record.get(key) {
                Some(Value::String(value)) => value.clone(),
                Some(Value::Null) => String::new(),
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ResultStatus;
    use serde_json::json;

    #[test]
    fn field_pattern_matches_braced_and_bare_names() {
        let caps = FIELD.captures("{stdout}").expect("braced");
        assert_eq!(caps.get(1).map(|name| name.as_str()), Some("stdout"));
        let caps = FIELD.captures("status").expect("bare");
        assert!(caps.get(1).is_none());
        assert_eq!(&caps[0], "status");
    }

    fn record(result: &CommandResult) -> Map<String, Value> {
        match result.to_record() {
            Value::Object(map) => map,
            other => panic!("unexpected record {other}"),
        }
    }

    #[test]
    fn substitutes_bare_and_braced_fields() {
        let mut result = CommandResult::new("zfs snapshot -r tank@a");
        result.name = "backup1".to_string();
        result.return_code = Some(1);
        let template = json!({
            "text": "name: command exited return_code",
            "tags": ["{name}", "unknown_word"],
            "nested": { "host": "{name}", "count": 3 }
        });
        let rendered = render_payload(&template, &record(&result));
        assert_eq!(rendered["text"], "backup1: zfs snapshot -r tank@a exited 1");
        assert_eq!(rendered["tags"], json!(["backup1", "unknown_word"]));
        assert_eq!(rendered["nested"]["host"], "backup1");
        assert_eq!(rendered["nested"]["count"], 3);
    }

    #[test]
    fn picks_target_by_outcome() {
        let pipe = Pipe::new(HttpPipe {
            enable: true,
            success: PipeTarget {
                url: "http://hooks.local/ok".to_string(),
                data: json!({ "text": "stdout" }),
                ..PipeTarget::default()
            },
            error: PipeTarget {
                url: "http://hooks.local/error".to_string(),
                data: json!({ "text": "stderr" }),
                ..PipeTarget::default()
            },
        });
        let mut result = CommandResult::new("true");
        result.stdout_lines = vec!["done\n".to_string()];
        let (target, payload) = pipe.prepare(&result).expect("success target");
        assert_eq!(target.url, "http://hooks.local/ok");
        assert_eq!(payload["text"], "done\n");

        result.status = ResultStatus::Error;
        result.stderr_lines = vec!["boom".to_string()];
        let (target, payload) = pipe.prepare(&result).expect("error target");
        assert_eq!(target.url, "http://hooks.local/error");
        assert_eq!(payload["text"], "boom");
    }

    #[test]
    fn disabled_pipe_prepares_nothing() {
        let pipe = Pipe::new(HttpPipe::default());
        assert!(pipe.prepare(&CommandResult::new("true")).is_none());
    }
}
