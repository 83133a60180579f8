//! Automation jobs: persisted records, per-job execution handlers and the
//! zfs-autobackup dataset selection.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use protocol::job::{render_template, FsRole, Job, JobKind, ScheduleMode, Trigger};
use protocol::{epoch_secs, CommandResult, ResultStatus};
use remote::{Profile, Ssh};
use runner::Cli;
use serde::Deserialize;
use zfs::{Execute, Zfs};

use crate::history::History;
use crate::pipe::Pipe;

pub(crate) const JOBS_FILE: &str = "jobs.json";
const LOCAL_HOST: &str = "local";

/// The trigger-evaluating collaborator. Implementations keep job records
/// and their next run times; firing a job goes through [`Automation::run`].
pub(crate) trait Scheduler: Send + Sync {
    /// Inserts or replaces the job with the same id.
    fn add(&self, job: Job) -> anyhow::Result<()>;
    fn remove(&self, id: &str) -> anyhow::Result<Option<Job>>;
    fn get(&self, id: &str) -> Option<Job>;
    fn list(&self) -> Vec<Job>;
    fn modify_next_run(&self, id: &str, next_run: Option<f64>) -> anyhow::Result<bool>;
}

/// Job records persisted as a JSON array. Evaluates no triggers.
pub(crate) struct JobStore {
    path: PathBuf,
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl JobStore {
    pub(crate) fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let jobs = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<Vec<Job>>(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let jobs = jobs.into_iter().map(|job| (job.id.clone(), job)).collect();
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, jobs: &BTreeMap<String, Job>) -> anyhow::Result<()> {
        write_jobs(&self.path, jobs)
    }
}

fn write_jobs(path: &Path, jobs: &BTreeMap<String, Job>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let records: Vec<&Job> = jobs.values().collect();
    let raw = serde_json::to_vec_pretty(&records).context("failed to encode jobs")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

impl Scheduler for JobStore {
    fn add(&self, job: Job) -> anyhow::Result<()> {
        let mut jobs = self.lock();
        jobs.insert(job.id.clone(), job);
        self.persist(&jobs)
    }

    fn remove(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let mut jobs = self.lock();
        let removed = jobs.remove(id);
        if removed.is_some() {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    fn get(&self, id: &str) -> Option<Job> {
        self.lock().get(id).cloned()
    }

    fn list(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    fn modify_next_run(&self, id: &str, next_run: Option<f64>) -> anyhow::Result<bool> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        job.next_run = next_run;
        self.persist(&jobs)?;
        Ok(true)
    }
}

/// A job as submitted. Expands into one [`Job`] per host.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JobRequest {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) command: String,
    #[serde(flatten)]
    pub(crate) kind: JobKind,
    /// Hosts that run `Local` and `ZfsAutobackup` jobs.
    #[serde(default)]
    pub(crate) source_hosts: Vec<String>,
    #[serde(default)]
    pub(crate) schedule_mode: ScheduleMode,
    #[serde(default)]
    pub(crate) triggers: Vec<Trigger>,
    #[serde(default)]
    pub(crate) pipe_success: bool,
    #[serde(default)]
    pub(crate) pipe_error: bool,
}

impl JobRequest {
    pub(crate) fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase()
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let name = self.normalized_name();
        if name.is_empty() {
            return Err("job name is empty".to_string());
        }
        if name.contains('@') || name.contains(char::is_whitespace) {
            return Err(format!("job name {name:?} may not contain '@' or whitespace"));
        }
        for trigger in &self.triggers {
            trigger.validate()?;
        }
        match &self.kind {
            JobKind::Remote { hosts } if hosts.is_empty() => {
                Err("remote job needs at least one host".to_string())
            }
            JobKind::ZfsAutobackup(_) if self.source_hosts.is_empty() => {
                Err("zfs-autobackup job needs at least one source host".to_string())
            }
            JobKind::ZfsAutobackup(spec) if !spec.prop.contains(':') => Err(format!(
                "selection property {:?} needs a ':' separated suffix",
                spec.prop
            )),
            JobKind::Remote { .. } | JobKind::Local if self.command.trim().is_empty() => {
                Err("command is empty".to_string())
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn hosts(&self) -> Vec<String> {
        match &self.kind {
            JobKind::Remote { hosts } => hosts.clone(),
            JobKind::ZfsAutobackup(_) => self.source_hosts.clone(),
            JobKind::Local => vec![self
                .source_hosts
                .first()
                .cloned()
                .unwrap_or_else(|| LOCAL_HOST.to_string())],
        }
    }

    pub(crate) fn expand(&self) -> Vec<Job> {
        let name = self.normalized_name();
        let timestamp = epoch_secs();
        self.hosts()
            .into_iter()
            .map(|host| {
                let command = match &self.kind {
                    JobKind::ZfsAutobackup(spec) if self.command.trim().is_empty() => {
                        spec.command(&name, &host)
                    }
                    _ => self.command.clone(),
                };
                Job {
                    id: Job::job_id(&name, &host),
                    name: name.clone(),
                    host,
                    command,
                    kind: self.kind.clone(),
                    schedule_mode: self.schedule_mode,
                    triggers: self.triggers.clone(),
                    pipe_success: self.pipe_success,
                    pipe_error: self.pipe_error,
                    next_run: None,
                    timestamp,
                }
            })
            .collect()
    }
}

/// Selection property of an autobackup job as set on `host`'s datasets.
pub(crate) fn selection_prop(job: &Job) -> Option<String> {
    match &job.kind {
        JobKind::ZfsAutobackup(spec) => Some(render_template(&spec.prop, &job.name, &job.host)),
        _ => None,
    }
}

/// Inherits `prop` on every dataset where it is set locally.
pub(crate) async fn clear_selection<E: Execute>(zfs: &Zfs<E>, prop: &str) -> Vec<CommandResult> {
    let mut results = Vec::new();
    let selected = zfs.filesystems_with_prop(prop).await;
    for filesystem in &selected.data {
        results.push(zfs.remove_filesystem_prop(filesystem, prop).await);
    }
    results
}

/// Replaces any previous selection with `filesystems`, writing each role's
/// property value.
pub(crate) async fn apply_selection<E: Execute>(
    zfs: &Zfs<E>,
    prop: &str,
    filesystems: &BTreeMap<String, FsRole>,
) -> Vec<CommandResult> {
    let mut results = clear_selection(zfs, prop).await;
    for role in [FsRole::Full, FsRole::Parent, FsRole::Child, FsRole::Exclude] {
        for (filesystem, _) in filesystems.iter().filter(|(_, selected)| **selected == role) {
            results.push(
                zfs.add_filesystem_prop(filesystem, prop, role.prop_value())
                    .await,
            );
        }
    }
    results
}

/// Runs one job's commands. Remote jobs reach their host over ssh; local
/// and autobackup jobs run on this machine.
pub(crate) enum JobHandler {
    Remote(Ssh),
    Local(Cli),
}

impl JobHandler {
    pub(crate) fn cli(&self) -> &Cli {
        match self {
            JobHandler::Remote(ssh) => ssh.cli(),
            JobHandler::Local(cli) => cli,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.cli().is_busy()
    }

    pub(crate) fn terminate(&self) {
        self.cli().terminate();
    }

    async fn execute(&self, command: &str) -> CommandResult {
        match self {
            JobHandler::Remote(ssh) => ssh.execute(command).await,
            JobHandler::Local(cli) => cli.execute(command).await,
        }
    }
}

#[derive(Debug)]
pub(crate) enum JobRunError {
    Missing,
    Busy,
    Setup(anyhow::Error),
}

pub(crate) struct Automation {
    scheduler: Arc<dyn Scheduler>,
    handlers: Mutex<HashMap<String, Arc<JobHandler>>>,
    profile: Arc<Profile>,
    kill_grace: Duration,
}

impl Automation {
    pub(crate) fn new(scheduler: Arc<dyn Scheduler>, profile: Arc<Profile>, kill_grace: Duration) -> Self {
        Self {
            scheduler,
            handlers: Mutex::new(HashMap::new()),
            profile,
            kill_grace,
        }
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub(crate) fn handler(&self, id: &str) -> Option<Arc<JobHandler>> {
        self.lock_handlers().get(id).cloned()
    }

    /// Existing handler for `job`, or a new one.
    pub(crate) fn handler_for(&self, job: &Job) -> anyhow::Result<Arc<JobHandler>> {
        let mut handlers = self.lock_handlers();
        if let Some(handler) = handlers.get(&job.id) {
            return Ok(Arc::clone(handler));
        }
        let handler = match &job.kind {
            JobKind::Remote { .. } => JobHandler::Remote(
                Ssh::attach(Arc::clone(&self.profile), &job.host)?.with_kill_grace(self.kill_grace),
            ),
            JobKind::Local | JobKind::ZfsAutobackup(_) => {
                JobHandler::Local(Cli::default().with_kill_grace(self.kill_grace))
            }
        };
        let handler = Arc::new(handler);
        handlers.insert(job.id.clone(), Arc::clone(&handler));
        Ok(handler)
    }

    pub(crate) fn drop_handler(&self, id: &str) {
        self.lock_handlers().remove(id);
    }

    /// Requests termination of every job command still running.
    pub(crate) fn terminate_all(&self) {
        for handler in self.lock_handlers().values() {
            if handler.is_busy() {
                handler.terminate();
            }
        }
    }

    /// Runs the job unless its handler is busy. The result lands in
    /// `history` and goes to the webhook when the job asks for it.
    pub(crate) async fn run(
        &self,
        id: &str,
        history: &History,
        pipe: &Pipe,
    ) -> Result<CommandResult, JobRunError> {
        let job = self.scheduler.get(id).ok_or(JobRunError::Missing)?;
        let handler = self.handler_for(&job).map_err(JobRunError::Setup)?;
        if handler.is_busy() {
            tracing::warn!(event = "job.skip", job = %job.id, "job handler busy, run skipped");
            return Err(JobRunError::Busy);
        }
        let command = job.rendered_command();
        tracing::info!(event = "job.run", job = %job.id, app = job.kind.label(), "job started");
        let mut result = handler.execute(&command).await;
        if runner::is_busy_skip(&result) {
            tracing::warn!(event = "job.skip", job = %job.id, "job handler busy, run skipped");
            return Err(JobRunError::Busy);
        }
        result.name = job.host.clone();
        if let JobKind::ZfsAutobackup(_) = job.kind {
            result.status = if result.return_code == Some(0) {
                ResultStatus::Success
            } else {
                ResultStatus::Error
            };
        }
        tracing::info!(
            event = "job.done",
            job = %job.id,
            status = result.status.as_str(),
            return_code = ?result.return_code,
            "job finished"
        );
        history.push(result.clone());
        if (job.pipe_success && !result.failed()) || (job.pipe_error && result.failed()) {
            pipe.send(&result);
        }
        Ok(result)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<String, Arc<JobHandler>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{temp_dir, ScriptedExecutor};
    use protocol::config::HttpPipe;
    use protocol::job::AutobackupSpec;

    fn local_job(name: &str, command: &str) -> Job {
        JobRequest {
            name: name.to_string(),
            command: command.to_string(),
            kind: JobKind::Local,
            source_hosts: Vec::new(),
            schedule_mode: ScheduleMode::Or,
            triggers: vec![Trigger::Interval("0:0:0:5:0".to_string())],
            pipe_success: false,
            pipe_error: false,
        }
        .expand()
        .remove(0)
    }

    fn autobackup_request(hosts: &[&str]) -> JobRequest {
        JobRequest {
            name: "Nightly".to_string(),
            command: String::new(),
            kind: JobKind::ZfsAutobackup(AutobackupSpec {
                prop: "autobackup:{name}".to_string(),
                target_host: "backup1".to_string(),
                target_path: "tank/backups".to_string(),
                options: BTreeMap::from([("ssh-source".to_string(), "{host}".to_string())]),
                filesystems: BTreeMap::from([
                    ("tank/data".to_string(), FsRole::Full),
                    ("tank/data/tmp".to_string(), FsRole::Exclude),
                    ("tank/home".to_string(), FsRole::Parent),
                ]),
            }),
            source_hosts: hosts.iter().map(|host| host.to_string()).collect(),
            schedule_mode: ScheduleMode::And,
            triggers: vec![Trigger::Cron("0 3 * * *".to_string())],
            pipe_success: false,
            pipe_error: true,
        }
    }

    #[test]
    fn store_persists_and_replaces_by_id() {
        let dir = temp_dir("snapdeck-jobs");
        let path = dir.join(JOBS_FILE);
        let store = JobStore::open(&path).expect("open");
        assert!(store.list().is_empty());

        store.add(local_job("prune", "echo one")).expect("add");
        store.add(local_job("prune", "echo two")).expect("replace");
        assert!(store.modify_next_run("prune@local", Some(42.0)).expect("next run"));
        assert!(!store.modify_next_run("ghost@local", None).expect("next run"));

        let reopened = JobStore::open(&path).expect("reopen");
        let jobs = reopened.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].command, "echo two");
        assert_eq!(jobs[0].next_run, Some(42.0));

        assert!(reopened.remove("prune@local").expect("remove").is_some());
        assert!(JobStore::open(&path).expect("reopen").list().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn remote_request_expands_one_job_per_host() {
        let request: JobRequest = serde_json::from_value(serde_json::json!({
            "name": "Scrub",
            "app": "remote",
            "hosts": ["web1", "web2"],
            "command": "zpool scrub {host}",
            "triggers": [{ "type": "Interval", "value": "1:0:0:0:0" }]
        }))
        .expect("decode request");
        assert!(request.validate().is_ok());
        let jobs = request.expand();
        let ids: Vec<_> = jobs.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec!["scrub@web1", "scrub@web2"]);
        assert_eq!(jobs[1].rendered_command(), "zpool scrub web2");
    }

    #[test]
    fn autobackup_request_builds_command_per_source() {
        let request = autobackup_request(&["prod1", "prod2"]);
        assert!(request.validate().is_ok());
        let jobs = request.expand();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "nightly@prod1");
        assert_eq!(
            jobs[0].rendered_command(),
            "zfs-autobackup --ssh-source prod1 nightly tank/backups"
        );
        assert_eq!(selection_prop(&jobs[1]).as_deref(), Some("autobackup:nightly"));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mut request = autobackup_request(&[]);
        assert!(request.validate().is_err());
        request.source_hosts = vec!["prod1".to_string()];
        request.triggers = vec![Trigger::Interval("5 minutes".to_string())];
        assert!(request.validate().is_err());
        request.triggers.clear();
        request.name = "bad name".to_string();
        assert!(request.validate().is_err());
    }

    #[tokio::test]
    async fn selection_is_cleared_then_written_per_role() {
        let zfs = Zfs::new(ScriptedExecutor::new("prod1").stdout(
            "zfs get -Hp -t filesystem,volume autobackup:nightly",
            &["tank/old\tautobackup:nightly\ttrue\tlocal\n"],
        ));
        let request = autobackup_request(&["prod1"]);
        let JobKind::ZfsAutobackup(spec) = &request.kind else {
            unreachable!()
        };
        apply_selection(&zfs, "autobackup:nightly", &spec.filesystems).await;
        assert_eq!(
            zfs.executor().calls(),
            vec![
                "zfs get -Hp -t filesystem,volume autobackup:nightly",
                "zfs inherit autobackup:nightly tank/old",
                "zfs set autobackup:nightly=true tank/data",
                "zfs set autobackup:nightly=parent tank/home",
                "zfs set autobackup:nightly=false tank/data/tmp",
            ]
        );
    }

    #[tokio::test]
    async fn local_job_runs_and_lands_in_history() {
        let dir = temp_dir("snapdeck-jobs-run");
        let store = Arc::new(JobStore::open(dir.join(JOBS_FILE)).expect("open"));
        store.add(local_job("hello", "printf hello")).expect("add");
        let automation = Automation::new(
            store,
            Arc::new(Profile::open(&dir)),
            Duration::from_millis(200),
        );
        let history = History::new(10);
        let pipe = Pipe::new(HttpPipe::default());

        let result = automation
            .run("hello@local", &history, &pipe)
            .await
            .expect("run");
        assert_eq!(result.stdout(), "hello");
        assert_eq!(result.name, "local");
        assert_eq!(history.records().len(), 1);
        assert!(matches!(
            automation.run("nope@local", &history, &pipe).await,
            Err(JobRunError::Missing)
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn busy_handler_skips_run() {
        let dir = temp_dir("snapdeck-jobs-busy");
        let store = Arc::new(JobStore::open(dir.join(JOBS_FILE)).expect("open"));
        store.add(local_job("slow", "sleep 1")).expect("add");
        let automation = Arc::new(Automation::new(
            store,
            Arc::new(Profile::open(&dir)),
            Duration::from_millis(200),
        ));
        let history = Arc::new(History::new(10));
        let pipe = Arc::new(Pipe::new(HttpPipe::default()));

        let first = {
            let automation = Arc::clone(&automation);
            let history = Arc::clone(&history);
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { automation.run("slow@local", &history, &pipe).await })
        };
        for _ in 0..50 {
            if automation.handler("slow@local").is_some_and(|handler| handler.is_busy()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            automation.run("slow@local", &history, &pipe).await,
            Err(JobRunError::Busy)
        ));
        automation
            .handler("slow@local")
            .expect("handler")
            .terminate();
        let finished = first.await.expect("join").expect("first run");
        assert!(finished.terminated);
        assert_eq!(history.records().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn remote_handler_requires_configured_host() {
        let dir = temp_dir("snapdeck-jobs-remote");
        let store = Arc::new(JobStore::open(dir.join(JOBS_FILE)).expect("open"));
        let mut job = local_job("ping", "true");
        job.kind = JobKind::Remote {
            hosts: vec!["ghost".to_string()],
        };
        job.host = "ghost".to_string();
        job.id = Job::job_id("ping", "ghost");
        store.add(job).expect("add");
        let automation = Automation::new(store, Arc::new(Profile::open(&dir)), Duration::from_millis(200));
        let outcome = automation
            .run("ping@ghost", &History::new(1), &Pipe::new(HttpPipe::default()))
            .await;
        assert!(matches!(outcome, Err(JobRunError::Setup(_))));
        std::fs::remove_dir_all(&dir).ok();
    }
}
