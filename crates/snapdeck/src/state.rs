//! Application context shared by the HTTP handlers: host connections, the
//! task queue, the history and the automation jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use protocol::job::{Job, JobKind};
use protocol::{CommandResult, Task, TaskAction, TaskStatus};
use remote::{HostSpec, Profile, Ssh};
use tokio::sync::{broadcast, RwLock};
use zfs::Zfs;

use crate::config::SnapdeckConfig;
use crate::events::SnapdeckEvent;
use crate::history::History;
use crate::jobs::{
    apply_selection, clear_selection, selection_prop, Automation, JobRequest, JobRunError,
    JobStore, JOBS_FILE,
};
use crate::pipe::Pipe;
use crate::tasks::{RunRefusal, TaskQueue};

pub(crate) type Connection = Zfs<Ssh>;

const EVENT_CAPACITY: usize = 512;

pub(crate) struct AppContext {
    config: SnapdeckConfig,
    profile: Arc<Profile>,
    hosts: RwLock<BTreeMap<String, Arc<Connection>>>,
    tasks: TaskQueue,
    history: History,
    automation: Automation,
    pipe: Pipe,
    events: broadcast::Sender<SnapdeckEvent>,
}

pub(crate) fn build_context(config: SnapdeckConfig) -> anyhow::Result<AppContext> {
    std::fs::create_dir_all(&config.profile_dir)
        .with_context(|| format!("failed to create {}", config.profile_dir.display()))?;
    let profile = Arc::new(Profile::open(&config.profile_dir));
    let mut hosts = BTreeMap::new();
    for host in profile.hosts() {
        match Ssh::attach(Arc::clone(&profile), &host) {
            Ok(ssh) => {
                hosts.insert(host, Arc::new(connection(&config, ssh)));
            }
            Err(err) => tracing::warn!(host = %host, error = %err, "skipping host"),
        }
    }
    tracing::info!(hosts = hosts.len(), profile = %config.profile_dir.display(), "hosts loaded");
    let store = JobStore::open(config.profile_dir.join(JOBS_FILE))?;
    let automation = Automation::new(Arc::new(store), Arc::clone(&profile), config.kill_grace());
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Ok(AppContext {
        history: History::new(config.history.limit),
        pipe: Pipe::new(config.pipes.http.clone()),
        profile,
        hosts: RwLock::new(hosts),
        tasks: TaskQueue::default(),
        automation,
        events,
        config,
    })
}

fn connection(config: &SnapdeckConfig, ssh: Ssh) -> Connection {
    Zfs::new(ssh.with_kill_grace(config.kill_grace())).with_timeout(config.cache_timeout())
}

impl AppContext {
    pub(crate) fn config(&self) -> &SnapdeckConfig {
        &self.config
    }

    pub(crate) fn profile(&self) -> &Profile {
        &self.profile
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SnapdeckEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SnapdeckEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn record(&self, result: &CommandResult) {
        let stderr = result.stderr();
        if !stderr.is_empty() {
            self.emit(SnapdeckEvent::Warning {
                host: result.name.clone(),
                message: stderr,
            });
        }
        self.emit(SnapdeckEvent::ResultRecorded {
            result: result.to_record(),
        });
    }

    pub(crate) async fn host_names(&self) -> Vec<String> {
        self.hosts.read().await.keys().cloned().collect()
    }

    pub(crate) async fn connection(&self, host: &str) -> Option<Arc<Connection>> {
        self.hosts.read().await.get(host).cloned()
    }

    pub(crate) async fn connections(&self) -> Vec<Arc<Connection>> {
        self.hosts.read().await.values().cloned().collect()
    }

    pub(crate) async fn upsert_host(&self, spec: HostSpec) -> anyhow::Result<Arc<Connection>> {
        let ssh = Ssh::open(Arc::clone(&self.profile), spec)?;
        let host = ssh.host().to_string();
        let connection = Arc::new(connection(&self.config, ssh));
        let hosts = {
            let mut hosts = self.hosts.write().await;
            hosts.insert(host, Arc::clone(&connection));
            hosts.keys().cloned().collect()
        };
        self.emit(SnapdeckEvent::HostsChanged { hosts });
        Ok(connection)
    }

    pub(crate) async fn remove_host(&self, host: &str) -> anyhow::Result<bool> {
        let (removed, hosts) = {
            let mut hosts = self.hosts.write().await;
            let removed = hosts.remove(host);
            (removed, hosts.keys().cloned().collect())
        };
        let Some(connection) = removed else {
            return Ok(false);
        };
        connection.executor().remove()?;
        self.emit(SnapdeckEvent::HostsChanged { hosts });
        Ok(true)
    }

    pub(crate) fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub(crate) fn history(&self) -> &History {
        &self.history
    }

    pub(crate) fn automation(&self) -> &Automation {
        &self.automation
    }

    /// Queues `command` for each host; with `auto` the new tasks run
    /// straight away.
    pub(crate) async fn enqueue_tasks(
        &self,
        action: TaskAction,
        command: &str,
        hosts: &[String],
        auto: bool,
    ) -> Vec<Task> {
        let tasks = self.tasks.enqueue(action, command, hosts);
        for task in &tasks {
            self.emit(SnapdeckEvent::TaskUpdated { task: task.clone() });
        }
        if !auto {
            return tasks;
        }
        let timestamps: Vec<u64> = tasks.iter().map(|task| task.timestamp).collect();
        self.apply_tasks(&timestamps)
            .await
            .into_iter()
            .filter_map(|(timestamp, outcome)| match outcome {
                Ok(task) => Some(task),
                Err(_) => self.tasks.get(timestamp),
            })
            .collect()
    }

    pub(crate) async fn run_task(&self, timestamp: u64) -> Result<Task, RunRefusal> {
        let task = self.tasks.get(timestamp).ok_or(RunRefusal::Missing)?;
        if task.status != TaskStatus::Pending {
            return Err(RunRefusal::NotPending(task.status));
        }
        let Some(connection) = self.connection(&task.host).await else {
            let failed = self
                .tasks
                .fail(timestamp, &format!("host {} is not configured", task.host))
                .ok_or(RunRefusal::Missing)?;
            self.emit(SnapdeckEvent::TaskUpdated {
                task: failed.clone(),
            });
            return Ok(failed);
        };
        if connection.is_busy() {
            return Err(RunRefusal::Busy);
        }
        let mut running = task.clone();
        running.status = TaskStatus::Running;
        self.emit(SnapdeckEvent::TaskUpdated { task: running });
        let done = self
            .tasks
            .run(timestamp, connection.as_ref(), &self.history)
            .await?;
        if let Some(result) = &done.result {
            self.record(result);
        }
        self.emit(SnapdeckEvent::TaskUpdated { task: done.clone() });
        Ok(done)
    }

    /// Runs the given tasks one after another in the order given.
    pub(crate) async fn apply_tasks(&self, timestamps: &[u64]) -> Vec<(u64, Result<Task, RunRefusal>)> {
        let mut outcomes = Vec::with_capacity(timestamps.len());
        for &timestamp in timestamps {
            outcomes.push((timestamp, self.run_task(timestamp).await));
        }
        outcomes
    }

    pub(crate) fn remove_task(&self, timestamp: u64) -> Option<Task> {
        let removed = self.tasks.remove(timestamp)?;
        self.emit(SnapdeckEvent::TaskRemoved { timestamp });
        Some(removed)
    }

    pub(crate) fn reset_tasks(&self, timestamps: &[u64]) -> Vec<Task> {
        let reset = self.tasks.reset(timestamps);
        for task in &reset {
            self.emit(SnapdeckEvent::TaskUpdated { task: task.clone() });
        }
        reset
    }

    /// Stores one job per host, replacing jobs of the same name. For
    /// zfs-autobackup jobs the dataset selection is written first.
    pub(crate) async fn save_job(&self, request: &JobRequest) -> anyhow::Result<Vec<Job>> {
        let jobs = request.expand();
        if matches!(request.kind, JobKind::ZfsAutobackup(_)) {
            for job in &jobs {
                if self.connection(&job.host).await.is_none() {
                    anyhow::bail!("host {} is not configured", job.host);
                }
            }
        }
        let name = request.normalized_name();
        let previous: Vec<Job> = self
            .automation
            .scheduler()
            .list()
            .into_iter()
            .filter(|job| job.name == name)
            .collect();
        for job in &previous {
            self.remove_job(&job.id).await?;
        }
        for job in &jobs {
            if let (JobKind::ZfsAutobackup(spec), Some(prop)) = (&job.kind, selection_prop(job)) {
                if let Some(connection) = self.connection(&job.host).await {
                    for result in
                        apply_selection(connection.as_ref(), &prop, &spec.filesystems).await
                    {
                        if result.return_code != Some(0) {
                            tracing::warn!(
                                host = %job.host,
                                command = %result.command,
                                stderr = %result.stderr().trim(),
                                "selection property update failed"
                            );
                        }
                    }
                }
            }
            self.automation.scheduler().add(job.clone())?;
            tracing::info!(event = "job.saved", job = %job.id, app = job.kind.label(), "job stored");
        }
        Ok(jobs)
    }

    pub(crate) async fn remove_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let Some(job) = self.automation.scheduler().remove(id)? else {
            return Ok(None);
        };
        self.automation.drop_handler(id);
        if let Some(prop) = selection_prop(&job) {
            match self.connection(&job.host).await {
                Some(connection) => {
                    clear_selection(connection.as_ref(), &prop).await;
                }
                None => tracing::warn!(
                    job = %job.id,
                    prop = %prop,
                    "host gone, selection property left in place"
                ),
            }
        }
        tracing::info!(event = "job.removed", job = %job.id, "job removed");
        Ok(Some(job))
    }

    /// Stops host and job commands still in flight, used on shutdown.
    pub(crate) async fn terminate_running(&self) {
        for connection in self.connections().await {
            if connection.is_busy() {
                connection.executor().terminate();
            }
        }
        self.automation.terminate_all();
    }

    pub(crate) async fn run_job(&self, id: &str) -> Result<CommandResult, JobRunError> {
        let result = self.automation.run(id, &self.history, &self.pipe).await?;
        self.record(&result);
        Ok(result)
    }
}
