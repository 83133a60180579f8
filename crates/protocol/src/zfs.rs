use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of `zfs list -t filesystem`, keyed by dataset name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filesystem {
    pub used_bytes: u64,
    pub avail_bytes: u64,
    pub refer_bytes: u64,
    pub mountpoint: String,
}

/// One row of `zfs list -t snapshot`, keyed by `filesystem@name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub filesystem: String,
    pub name: String,
    pub used_bytes: u64,
    pub used: String,
    pub creation: i64,
    pub creation_date: String,
    pub creation_time: String,
    pub userrefs: u64,
}

impl Snapshot {
    pub fn key(&self) -> String {
        format!("{}@{}", self.filesystem, self.name)
    }
}

/// A regular file found under a filesystem's `.zfs/snapshot` directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotFile {
    pub location: String,
    pub name: String,
    pub path: String,
    pub bytes: u64,
    pub size: String,
    pub modified_timestamp: f64,
    pub modified_datetime: String,
}

pub type Filesystems = BTreeMap<String, Filesystem>;
pub type Snapshots = BTreeMap<String, Snapshot>;
/// Snapshot key to the tags holding it.
pub type Holds = BTreeMap<String, Vec<String>>;
