use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub const FILESYSTEMS: &str = "filesystems";
pub const SNAPSHOTS: &str = "snapshots";
pub const HOLDS: &str = "holds_for_snapshot";

/// Last run time and last parsed value per logical query, owned by one
/// connection.
#[derive(Debug, Default)]
pub struct QueryCache {
    run_times: HashMap<String, Instant>,
    data: HashMap<String, Value>,
}

impl QueryCache {
    /// A query must run when it has no stored value, was never run, was
    /// invalidated, or last ran more than `timeout` ago.
    pub fn is_ready(&self, query: &str, timeout: Duration) -> bool {
        match (self.run_times.get(query), self.data.get(query)) {
            (Some(ran_at), Some(_)) => ran_at.elapsed() > timeout,
            _ => true,
        }
    }

    pub fn set_run_time(&mut self, query: &str) {
        self.run_times.insert(query.to_string(), Instant::now());
    }

    /// Forgets the run time of `query`, or of every query when `None`.
    /// Stored values stay available for merging.
    pub fn invalidate(&mut self, query: Option<&str>) {
        match query {
            Some(query) => {
                self.run_times.remove(query);
            }
            None => self.run_times.clear(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, query: &str) -> Option<T> {
        let value = self.data.get(query)?;
        match serde_json::from_value(value.clone()) {
            Ok(data) => Some(data),
            Err(err) => {
                tracing::warn!(query, error = %err, "cached value has unexpected shape");
                None
            }
        }
    }

    pub fn store<T: Serialize>(&mut self, query: &str, data: &T) {
        match serde_json::to_value(data) {
            Ok(value) => {
                self.data.insert(query.to_string(), value);
            }
            Err(err) => tracing::warn!(query, error = %err, "failed to cache query result"),
        }
    }
}
