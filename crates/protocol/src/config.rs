use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Where finished results are forwarded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipeConfig {
    #[serde(default)]
    pub http: HttpPipe,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpPipe {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub success: PipeTarget,
    #[serde(default)]
    pub error: PipeTarget,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipeTarget {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON template; bare result field names inside strings are substituted.
    #[serde(default)]
    pub data: Value,
}
