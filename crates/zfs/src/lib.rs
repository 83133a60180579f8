//! ZFS commands and queries over any [`Execute`] backend, with a per
//! connection query cache.

pub mod cache;
pub mod command;
pub mod format;
pub mod parse;

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use protocol::zfs::{Filesystems, Holds, SnapshotFile, Snapshots};
use protocol::{CommandResult, ResultStatus};
use remote::Ssh;
use runner::Cli;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as QueryTurn;

pub use self::cache::QueryCache;
pub use self::command::{
    SnapshotCommand, SnapshotCreate, SnapshotDestroy, SnapshotHold, SnapshotRelease,
    SnapshotRename,
};
pub use self::format::format_bytes;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_FIND_LINES: usize = 1000;
const LOG_COMMAND_LIMIT: usize = 160;

/// Where commands run. `max_output_lines` of 0 means unlimited.
#[async_trait]
pub trait Execute: Send + Sync {
    fn name(&self) -> &str;
    fn is_busy(&self) -> bool;
    async fn execute(&self, command: &str, max_output_lines: usize) -> CommandResult;
}

#[async_trait]
impl Execute for Ssh {
    fn name(&self) -> &str {
        self.host()
    }

    fn is_busy(&self) -> bool {
        Ssh::is_busy(self)
    }

    async fn execute(&self, command: &str, max_output_lines: usize) -> CommandResult {
        self.execute_with_limit(command, max_output_lines).await
    }
}

#[async_trait]
impl Execute for Cli {
    fn name(&self) -> &str {
        "local"
    }

    fn is_busy(&self) -> bool {
        Cli::is_busy(self)
    }

    async fn execute(&self, command: &str, max_output_lines: usize) -> CommandResult {
        self.execute_with_limit(command, max_output_lines).await
    }
}

pub struct Zfs<E> {
    executor: E,
    cache: Mutex<QueryCache>,
    /// Held for the duration of one query so reads on a connection queue
    /// up instead of tripping the executor's busy guard.
    turn: QueryTurn<()>,
    timeout: Duration,
}

impl<E: Execute> Zfs<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            cache: Mutex::new(QueryCache::default()),
            turn: QueryTurn::new(()),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn name(&self) -> &str {
        self.executor.name()
    }

    pub fn is_busy(&self) -> bool {
        self.executor.is_busy()
    }

    pub fn is_ready(&self, query: &str) -> bool {
        self.cache().is_ready(query, self.timeout)
    }

    pub fn set_run_time(&self, query: &str) {
        self.cache().set_run_time(query);
    }

    pub fn invalidate(&self, query: Option<&str>) {
        self.cache().invalidate(query);
    }

    /// Runs a user-level command, logging it with the connection name.
    pub async fn execute(&self, command: &str) -> CommandResult {
        tracing::info!(
            host = %self.name(),
            command = %truncate_for_log(command),
            "zfs command"
        );
        self.executor.execute(command, 0).await
    }

    /// Runs `command` unless `query` was answered within the timeout, in
    /// which case the stored value comes back with `cached` set. Only
    /// successful runs replace the stored value. When the executor is busy
    /// with a user command the last stored value is served instead.
    pub async fn query<T, F>(&self, query: &str, command: &str, parse: F) -> CommandResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&[String]) -> T,
    {
        if let Some(data) = self.cached::<T>(query) {
            return self.cached_result(command, data);
        }
        let _turn = self.turn.lock().await;
        // answered while we waited
        if let Some(data) = self.cached::<T>(query) {
            return self.cached_result(command, data);
        }
        let result = self.run_query_in_turn(command, 0).await;
        if runner::is_busy_skip(&result) {
            if let Some(data) = self.cache().get::<T>(query) {
                tracing::debug!(host = %self.name(), query, "executor busy, serving stored value");
                return self.cached_result(command, data);
            }
            let data = parse(&result.stdout_lines);
            return result.with_data(data);
        }
        let data = parse(&result.stdout_lines);
        {
            let mut state = self.cache();
            if !result.failed() {
                state.store(query, &data);
            }
            state.set_run_time(query);
        }
        result.with_data(data)
    }

    pub async fn filesystems(&self) -> CommandResult<Filesystems> {
        self.query(
            cache::FILESYSTEMS,
            "zfs list -Hp -t filesystem -o name,used,avail,refer,mountpoint",
            parse::parse_filesystems,
        )
        .await
    }

    pub async fn snapshots(&self) -> CommandResult<Snapshots> {
        self.query(
            cache::SNAPSHOTS,
            "zfs list -Hp -t snapshot -o name,used,creation,userrefs",
            parse::parse_snapshots,
        )
        .await
    }

    /// Hold tags per snapshot. Without a snapshot, every snapshot whose
    /// `userrefs` is non-zero is asked about; with one, only that entry
    /// is returned (empty when it carries no holds).
    pub async fn holds_for_snapshot(&self, snapshot: Option<&str>) -> CommandResult<Holds> {
        if let Some(all) = self.cached::<Holds>(cache::HOLDS) {
            return self.cached_result("", select_holds(all, snapshot));
        }
        let targets = match snapshot {
            Some(snapshot) => snapshot.to_string(),
            None => {
                let snapshots = self.snapshots().await;
                snapshots
                    .data
                    .values()
                    .filter(|snap| snap.userrefs > 0)
                    .map(|snap| snap.key())
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        };
        if targets.is_empty() {
            let mut result = CommandResult::with_payload(String::new(), Holds::new());
            result.name = self.name().to_string();
            return result;
        }
        let result = self
            .run_query(&format!("zfs holds -H -r {targets}"), 0)
            .await;
        if runner::is_busy_skip(&result) {
            if let Some(all) = self.cache().get::<Holds>(cache::HOLDS) {
                return self.cached_result("", select_holds(all, snapshot));
            }
        }
        let parsed = parse::parse_holds(&result.stdout_lines);
        let all = {
            let mut state = self.cache();
            let all = match snapshot {
                Some(snapshot) => {
                    let mut all: Holds = state.get(cache::HOLDS).unwrap_or_default();
                    all.remove(snapshot);
                    all.extend(parsed);
                    all
                }
                None => parsed,
            };
            if !result.failed() {
                state.store(cache::HOLDS, &all);
            }
            state.set_run_time(cache::HOLDS);
            all
        };
        result.with_data(select_holds(all, snapshot))
    }

    /// Datasets on which `prop` is set locally.
    pub async fn filesystems_with_prop(&self, prop: &str) -> CommandResult<Vec<String>> {
        let result = self
            .run_query(&format!("zfs get -Hp -t filesystem,volume {prop}"), 0)
            .await;
        let names = parse::parse_local_prop(&result.stdout_lines, prop);
        result.with_data(names)
    }

    /// Files matching `pattern` in any snapshot of `filesystem`. Output
    /// beyond `max_lines` stops the search and sets `truncated`.
    pub async fn find_files_in_snapshots(
        &self,
        filesystem: &str,
        pattern: &str,
        max_lines: usize,
    ) -> CommandResult<Vec<SnapshotFile>> {
        let filesystems = self.filesystems().await;
        let Some(mountpoint) = filesystems
            .data
            .get(filesystem)
            .map(|fs| fs.mountpoint.clone())
        else {
            let mut result = CommandResult::with_payload(String::new(), Vec::new());
            result.name = self.name().to_string();
            result.status = ResultStatus::Error;
            result.trace = format!("unknown filesystem {filesystem}");
            return result;
        };
        let command = format!(
            "find {mountpoint}/.zfs/snapshot -type f -name '{pattern}' -printf '%h\\t%f\\t%s\\t%T@\\n'"
        );
        let result = self.run_query(&command, max_lines).await;
        let files = parse::parse_find(&result.stdout_lines);
        result.with_data(files)
    }

    pub async fn add_filesystem_prop(&self, filesystem: &str, prop: &str, value: &str) -> CommandResult {
        self.execute(&format!("zfs set {prop}={value} {filesystem}"))
            .await
    }

    pub async fn remove_filesystem_prop(&self, filesystem: &str, prop: &str) -> CommandResult {
        self.execute(&format!("zfs inherit {prop} {filesystem}"))
            .await
    }

    fn cache(&self) -> MutexGuard<'_, QueryCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached<T: DeserializeOwned>(&self, query: &str) -> Option<T> {
        let cache = self.cache();
        if cache.is_ready(query, self.timeout) {
            return None;
        }
        cache.get(query)
    }

    fn cached_result<T>(&self, command: &str, data: T) -> CommandResult<T> {
        let mut result = CommandResult::from_cache(data);
        result.name = self.name().to_string();
        result.command = command.to_string();
        result
    }

    async fn run_query(&self, command: &str, max_output_lines: usize) -> CommandResult {
        let _turn = self.turn.lock().await;
        self.run_query_in_turn(command, max_output_lines).await
    }

    /// Queries count a non-zero exit as failure.
    async fn run_query_in_turn(&self, command: &str, max_output_lines: usize) -> CommandResult {
        let mut result = self.executor.execute(command, max_output_lines).await;
        if result.return_code != Some(0) && !result.truncated {
            result.status = ResultStatus::Error;
        }
        result
    }
}

fn select_holds(all: Holds, snapshot: Option<&str>) -> Holds {
    match snapshot {
        None => all,
        Some(snapshot) => {
            let tags = all.get(snapshot).cloned().unwrap_or_default();
            Holds::from([(snapshot.to_string(), tags)])
        }
    }
}

fn truncate_for_log(command: &str) -> String {
    match command.char_indices().nth(LOG_COMMAND_LIMIT) {
        Some((cut, _)) => format!("{}...", &command[..cut]),
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Refuses overlapping runs the way `Cli` does.
    #[derive(Default)]
    struct FakeExecutor {
        outputs: HashMap<String, Vec<String>>,
        return_code: i32,
        delay: Duration,
        running: AtomicBool,
        /// Simulates a user command occupying the executor.
        occupied: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn with(mut self, command: &str, lines: &[&str]) -> Self {
            self.outputs.insert(
                command.to_string(),
                lines.iter().map(|line| line.to_string()).collect(),
            );
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Execute for FakeExecutor {
        fn name(&self) -> &str {
            "backup1"
        }

        fn is_busy(&self) -> bool {
            self.occupied.load(Ordering::SeqCst) || self.running.load(Ordering::SeqCst)
        }

        async fn execute(&self, command: &str, max_output_lines: usize) -> CommandResult {
            if self.occupied.load(Ordering::SeqCst)
                || self
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                let mut refused = CommandResult::new(command);
                refused.return_code = None;
                refused.status = ResultStatus::Error;
                refused.trace = runner::BUSY_TRACE.to_string();
                return refused;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.store(false, Ordering::SeqCst);
            self.calls.lock().unwrap().push(command.to_string());
            let mut result = CommandResult::new(command);
            result.name = "backup1".to_string();
            result.return_code = Some(self.return_code);
            let mut lines = self.outputs.get(command).cloned().unwrap_or_default();
            if max_output_lines > 0 && lines.len() > max_output_lines {
                lines.truncate(max_output_lines);
                result.truncated = true;
                result.return_code = None;
            }
            result.stdout_lines = lines;
            result
        }
    }

    const LIST_FS: &str = "zfs list -Hp -t filesystem -o name,used,avail,refer,mountpoint";
    const LIST_SNAPS: &str = "zfs list -Hp -t snapshot -o name,used,creation,userrefs";

    #[tokio::test]
    async fn filesystems_with_prop_keeps_local_source_only() {
        let command = "zfs get -Hp -t filesystem,volume autobackup:job1";
        let zfs = Zfs::new(
            FakeExecutor::default().with(command, &["tank/data\tautobackup:job1\ttrue\tlocal\n"]),
        );
        let result = zfs.filesystems_with_prop("autobackup:job1").await;
        assert_eq!(result.data, vec!["tank/data".to_string()]);
        assert_eq!(result.name, "backup1");

        let zfs = Zfs::new(
            FakeExecutor::default()
                .with(command, &["tank/data\tautobackup:job1\ttrue\tinherited\n"]),
        );
        assert!(zfs.filesystems_with_prop("autobackup:job1").await.data.is_empty());
    }

    #[tokio::test]
    async fn holds_without_held_snapshots_never_runs_zfs_holds() {
        let zfs = Zfs::new(FakeExecutor::default().with(
            LIST_SNAPS,
            &["tank/data@a\t100\t1700000000\t0\n", "tank/data@b\t100\t1700000000\t0\n"],
        ));
        let result = zfs.holds_for_snapshot(None).await;
        assert!(result.data.is_empty());
        assert!(!result.failed());
        assert_eq!(zfs.executor().calls(), vec![LIST_SNAPS.to_string()]);
    }

    #[tokio::test]
    async fn holds_only_query_held_snapshots() {
        let holds = "zfs holds -H -r tank/data@b tank/data@c";
        let zfs = Zfs::new(
            FakeExecutor::default()
                .with(
                    LIST_SNAPS,
                    &[
                        "tank/data@a\t100\t1700000000\t0\n",
                        "tank/data@b\t100\t1700000000\t1\n",
                        "tank/data@c\t100\t1700000000\t2\n",
                    ],
                )
                .with(
                    holds,
                    &[
                        "tank/data@b\tkeep\tTue Nov 14 22:13 2023\n",
                        "tank/data@c\tkeep\tTue Nov 14 22:13 2023\n",
                        "tank/data@c\tbackup\tTue Nov 14 22:13 2023\n",
                    ],
                ),
        );
        let result = zfs.holds_for_snapshot(None).await;
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data["tank/data@c"], vec!["keep", "backup"]);
        assert_eq!(zfs.executor().calls().last().map(String::as_str), Some(holds));

        let cached = zfs.holds_for_snapshot(Some("tank/data@b")).await;
        assert!(cached.cached);
        assert_eq!(cached.data["tank/data@b"], vec!["keep"]);

        let missing = zfs.holds_for_snapshot(Some("tank/data@zzz")).await;
        assert!(missing.cached);
        assert!(missing.data["tank/data@zzz"].is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_served_from_cache_until_invalidated() {
        let zfs = Zfs::new(
            FakeExecutor::default().with(LIST_SNAPS, &["tank/data@a\t1536\t1700000000\t0\n"]),
        );
        let first = zfs.snapshots().await;
        assert!(!first.cached);
        assert_eq!(first.data["tank/data@a"].used, "1.5KB");

        let second = zfs.snapshots().await;
        assert!(second.cached);
        assert_eq!(second.data, first.data);
        assert_eq!(zfs.executor().calls().len(), 1);

        zfs.invalidate(Some(cache::SNAPSHOTS));
        assert!(zfs.is_ready(cache::SNAPSHOTS));
        let third = zfs.snapshots().await;
        assert!(!third.cached);
        assert_eq!(zfs.executor().calls().len(), 2);
    }

    #[tokio::test]
    async fn overlapping_queries_on_one_connection_both_succeed() {
        let zfs = Zfs::new(FakeExecutor {
            delay: Duration::from_millis(50),
            ..FakeExecutor::default()
                .with(LIST_FS, &["tank\t1\t2\t3\t/tank\n"])
                .with(LIST_SNAPS, &["tank@a\t100\t1700000000\t0\n"])
        });
        let (filesystems, snapshots) = tokio::join!(zfs.filesystems(), zfs.snapshots());
        assert!(!filesystems.failed());
        assert_eq!(filesystems.data.len(), 1);
        assert!(!snapshots.failed(), "trace: {}", snapshots.trace);
        assert_eq!(snapshots.data.len(), 1);
        assert_eq!(zfs.executor().calls().len(), 2);
    }

    #[tokio::test]
    async fn occupied_executor_serves_stored_value() {
        let zfs = Zfs::new(
            FakeExecutor::default().with(LIST_SNAPS, &["tank@a\t100\t1700000000\t0\n"]),
        );
        let fresh = zfs.snapshots().await;
        zfs.invalidate(None);
        zfs.executor().occupied.store(true, Ordering::SeqCst);

        let stored = zfs.snapshots().await;
        assert!(stored.cached);
        assert!(!stored.failed());
        assert_eq!(stored.data, fresh.data);
        assert_eq!(zfs.executor().calls().len(), 1);

        let empty = Zfs::new(FakeExecutor::default());
        empty.executor().occupied.store(true, Ordering::SeqCst);
        let refused = empty.filesystems().await;
        assert!(refused.failed());
        assert_eq!(refused.trace, runner::BUSY_TRACE);
        assert_eq!(refused.return_code, None);
        assert!(refused.data.is_empty());
    }

    #[tokio::test]
    async fn failed_query_is_not_cached() {
        let zfs = Zfs::new(FakeExecutor {
            return_code: 1,
            ..FakeExecutor::default()
        });
        let result = zfs.filesystems().await;
        assert!(result.failed());
        assert!(zfs.is_ready(cache::FILESYSTEMS));
        zfs.filesystems().await;
        assert_eq!(zfs.executor().calls().len(), 2);
    }

    #[tokio::test]
    async fn invalidate_before_first_run_executes_fresh() {
        let zfs = Zfs::new(FakeExecutor::default().with(LIST_FS, &["tank\t1\t2\t3\t/tank\n"]));
        zfs.invalidate(Some(cache::FILESYSTEMS));
        let result = zfs.filesystems().await;
        assert!(!result.cached);
        assert_eq!(result.data["tank"].mountpoint, "/tank");
    }

    #[tokio::test]
    async fn find_uses_mountpoint_and_flags_truncation() {
        let find = "find /tank/data/.zfs/snapshot -type f -name '*.txt' -printf '%h\\t%f\\t%s\\t%T@\\n'";
        let zfs = Zfs::new(
            FakeExecutor::default()
                .with(LIST_FS, &["tank/data\t1\t2\t3\t/tank/data\n"])
                .with(
                    find,
                    &[
                        "/tank/data/.zfs/snapshot/a\tone.txt\t10\t1700000000.0\n",
                        "/tank/data/.zfs/snapshot/b\ttwo.txt\t20\t1700000000.0\n",
                        "/tank/data/.zfs/snapshot/c\tthree.txt\t30\t1700000000.0\n",
                    ],
                ),
        );
        let result = zfs.find_files_in_snapshots("tank/data", "*.txt", 2).await;
        assert_eq!(result.command, find);
        assert!(result.truncated);
        assert!(!result.failed());
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data[1].path, "/tank/data/.zfs/snapshot/b/two.txt");
    }

    #[tokio::test]
    async fn find_on_unknown_filesystem_fails_without_running_find() {
        let zfs = Zfs::new(FakeExecutor::default().with(LIST_FS, &["tank\t1\t2\t3\t/tank\n"]));
        let result = zfs.find_files_in_snapshots("tank/missing", "*", 10).await;
        assert!(result.failed());
        assert!(result.data.is_empty());
        assert_eq!(zfs.executor().calls(), vec![LIST_FS.to_string()]);
    }

    #[tokio::test]
    async fn property_mutations_render_set_and_inherit() {
        let zfs = Zfs::new(FakeExecutor::default());
        let set = zfs.add_filesystem_prop("tank/data", "autobackup:job1", "true").await;
        assert_eq!(set.command, "zfs set autobackup:job1=true tank/data");
        let inherit = zfs.remove_filesystem_prop("tank/data", "autobackup:job1").await;
        assert_eq!(inherit.command, "zfs inherit autobackup:job1 tank/data");
    }

    #[test]
    fn long_commands_are_cut_for_logging() {
        let long = "x".repeat(200);
        let cut = truncate_for_log(&long);
        assert_eq!(cut.len(), LOG_COMMAND_LIMIT + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_for_log("zfs list"), "zfs list");
    }
}
