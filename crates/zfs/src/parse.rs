//! Parsers for tab separated `zfs`/`find` output. Lines that do not match
//! the expected shape are skipped.

use std::sync::LazyLock;

use protocol::zfs::{Filesystem, Filesystems, Holds, Snapshot, SnapshotFile, Snapshots};
use regex::Regex;

use crate::format::{format_bytes, format_epoch};

static FILESYSTEM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<filesystem>[^\t]+)\t(?P<used>[^\t]+)\t(?P<avail>[^\t]+)\t(?P<refer>[^\t]+)\t(?P<mountpoint>[^\n]+)",
    )
    .expect("filesystem line pattern")
});

static SNAPSHOT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<filesystem>[^@]+)@(?P<name>[^\t]+)\t(?P<used>[^\t]+)\t(?P<creation>[^\t]+)\t(?P<userrefs>[^\n]+)",
    )
    .expect("snapshot line pattern")
});

static HOLD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<filesystem>[^@]+)@(?P<name>[^\t]+)\t(?P<tag>[^\t]+)\t(?P<creation>[^\n]+)")
        .expect("hold line pattern")
});

static PROPERTY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[^\t]+)\t(?P<property>[^\t]+)\t(?P<value>[^\t]+)\t(?P<source>[^\n]+)")
        .expect("property line pattern")
});

static FIND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<location>[^\t]+)\t(?P<name>[^\t]+)\t(?P<bytes>[^\t]+)\t(?P<modified>[^\n]+)")
        .expect("find line pattern")
});

/// `zfs list -Hp -t filesystem -o name,used,avail,refer,mountpoint`
pub fn parse_filesystems(lines: &[String]) -> Filesystems {
    let mut filesystems = Filesystems::new();
    let re = &*FILESYSTEM_LINE;
    for line in lines {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let (Ok(used), Ok(avail), Ok(refer)) = (
            caps["used"].parse::<u64>(),
            caps["avail"].parse::<u64>(),
            caps["refer"].parse::<u64>(),
        ) else {
            continue;
        };
        filesystems.insert(
            caps["filesystem"].to_string(),
            Filesystem {
                used_bytes: used,
                avail_bytes: avail,
                refer_bytes: refer,
                mountpoint: caps["mountpoint"].trim_end().to_string(),
            },
        );
    }
    filesystems
}

/// `zfs list -Hp -t snapshot -o name,used,creation,userrefs`
pub fn parse_snapshots(lines: &[String]) -> Snapshots {
    let mut snapshots = Snapshots::new();
    let re = &*SNAPSHOT_LINE;
    for line in lines {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let (Ok(used_bytes), Ok(creation), Ok(userrefs)) = (
            caps["used"].parse::<u64>(),
            caps["creation"].parse::<i64>(),
            caps["userrefs"].trim_end().parse::<u64>(),
        ) else {
            continue;
        };
        let snapshot = Snapshot {
            filesystem: caps["filesystem"].to_string(),
            name: caps["name"].to_string(),
            used_bytes,
            used: format_bytes(used_bytes as f64),
            creation,
            creation_date: format_epoch(creation as f64, "%Y/%m/%d"),
            creation_time: format_epoch(creation as f64, "%H:%M"),
            userrefs,
        };
        snapshots.insert(snapshot.key(), snapshot);
    }
    snapshots
}

/// `zfs holds -H -r <snapshots>`
pub fn parse_holds(lines: &[String]) -> Holds {
    let mut holds = Holds::new();
    let re = &*HOLD_LINE;
    for line in lines {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let key = format!("{}@{}", &caps["filesystem"], &caps["name"]);
        holds.entry(key).or_default().push(caps["tag"].to_string());
    }
    holds
}

/// `zfs get -Hp -t filesystem,volume <prop>`, keeping datasets where
/// `prop` is set locally rather than inherited or defaulted.
pub fn parse_local_prop(lines: &[String], prop: &str) -> Vec<String> {
    let re = &*PROPERTY_LINE;
    lines
        .iter()
        .filter_map(|line| re.captures(line))
        .filter(|caps| &caps["property"] == prop && caps["source"].trim_end() == "local")
        .map(|caps| caps["name"].to_string())
        .collect()
}

/// `find ... -printf '%h\t%f\t%s\t%T@\n'`
pub fn parse_find(lines: &[String]) -> Vec<SnapshotFile> {
    let mut files = Vec::new();
    let re = &*FIND_LINE;
    for line in lines {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let (Ok(bytes), Ok(modified)) = (
            caps["bytes"].parse::<u64>(),
            caps["modified"].trim_end().parse::<f64>(),
        ) else {
            continue;
        };
        let location = caps["location"].to_string();
        let name = caps["name"].to_string();
        files.push(SnapshotFile {
            path: format!("{location}/{name}"),
            location,
            name,
            bytes,
            size: format_bytes(bytes as f64),
            modified_timestamp: modified,
            modified_datetime: format_epoch(modified, "%Y/%m/%d %H:%M:%S"),
        });
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| line.to_string()).collect()
    }

    #[test]
    fn line_patterns_expose_their_fields() {
        let patterns: [(&Regex, Vec<&str>); 5] = [
            (&*FILESYSTEM_LINE, vec!["filesystem", "used", "avail", "refer", "mountpoint"]),
            (&*SNAPSHOT_LINE, vec!["filesystem", "name", "used", "creation", "userrefs"]),
            (&*HOLD_LINE, vec!["filesystem", "name", "tag", "creation"]),
            (&*PROPERTY_LINE, vec!["name", "property", "value", "source"]),
            (&*FIND_LINE, vec!["location", "name", "bytes", "modified"]),
        ];
        for (re, fields) in patterns {
            let names: Vec<&str> = re.capture_names().flatten().collect();
            assert_eq!(names, fields);
        }
    }

    #[test]
    fn filesystems_skip_malformed_rows() {
        let parsed = parse_filesystems(&lines(&[
            "tank\t1024\t2048\t512\t/tank\n",
            "garbage line\n",
            "tank/data\t10\tx\t5\t/tank/data\n",
            "tank/home\t10\t20\t5\t/home\n",
        ]));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["tank"].avail_bytes, 2048);
        assert_eq!(parsed["tank/home"].mountpoint, "/home");
    }

    #[test]
    fn snapshots_derive_display_fields() {
        let parsed = parse_snapshots(&lines(&["tank/data@daily-1\t1536\t1700000000\t2\n"]));
        let snap = &parsed["tank/data@daily-1"];
        assert_eq!(snap.filesystem, "tank/data");
        assert_eq!(snap.name, "daily-1");
        assert_eq!(snap.used, "1.5KB");
        assert_eq!(snap.userrefs, 2);
        assert_eq!(snap.creation, 1_700_000_000);
        assert_eq!(snap.creation_date.len(), "2023/11/14".len());
        assert_eq!(snap.creation_time.len(), "22:13".len());
    }

    #[test]
    fn holds_group_tags_per_snapshot() {
        let parsed = parse_holds(&lines(&[
            "tank/data@a\tkeep\tTue Nov 14 22:13 2023\n",
            "tank/data@a\tbackup\tTue Nov 14 22:13 2023\n",
            "tank/data@b\tkeep\tTue Nov 14 22:13 2023\n",
        ]));
        assert_eq!(parsed["tank/data@a"], vec!["keep", "backup"]);
        assert_eq!(parsed["tank/data@b"], vec!["keep"]);
    }

    #[test]
    fn local_prop_ignores_inherited() {
        let local = lines(&["tank/data\tautobackup:job1\ttrue\tlocal\n"]);
        assert_eq!(parse_local_prop(&local, "autobackup:job1"), vec!["tank/data"]);
        let inherited = lines(&["tank/data\tautobackup:job1\ttrue\tinherited from tank\n"]);
        assert!(parse_local_prop(&inherited, "autobackup:job1").is_empty());
        assert!(parse_local_prop(&local, "autobackup:job2").is_empty());
    }

    #[test]
    fn find_builds_paths_and_sizes() {
        let parsed = parse_find(&lines(&[
            "/tank/data/.zfs/snapshot/a/docs\treport.txt\t2048\t1700000000.5\n",
            "no tabs here\n",
        ]));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].path, "/tank/data/.zfs/snapshot/a/docs/report.txt");
        assert_eq!(parsed[0].size, "2KB");
        assert_eq!(parsed[0].modified_timestamp, 1_700_000_000.5);
    }
}
