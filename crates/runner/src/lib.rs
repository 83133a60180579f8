//! Local process execution with streamed, observable output.
//!
//! A [`Cli`] runs one command at a time. Output is split into chunks as it
//! arrives, kept in memory for the duration of the run, and copied to any
//! attached [`Observer`]. Late observers first receive everything captured
//! so far.

mod capture;
mod observer;
mod output;
mod process;
mod stream;

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use protocol::CommandResult;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub use capture::Stream;
pub use observer::{ChannelObserver, Observer, ObserverId};
pub use stream::BLOCK_SIZE;

use self::capture::Capture;
use self::output::{build_result, failed_result, RunOutcome};
use self::process::{apply_process_group, terminate_child};
use self::stream::read_stream_chunks;

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
pub const BUSY_TRACE: &str = "busy";

/// Whether `result` is the placeholder returned for a run refused because
/// another one was in flight.
pub fn is_busy_skip(result: &CommandResult) -> bool {
    result.trace == BUSY_TRACE && result.return_code.is_none()
}

/// What to start.
#[derive(Debug, Clone)]
pub enum Invocation {
    /// Program plus arguments, no shell involved.
    Argv(Vec<String>),
    /// Passed to `/bin/sh -c`.
    Shell(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop the process once this many chunks were captured; 0 = unlimited.
    pub max_output_lines: usize,
    pub envs: Vec<(String, String)>,
    /// Whether [`Cli::terminate`] applies to this run.
    pub cancellable: bool,
}

pub struct Cli {
    delimiter: Option<u8>,
    kill_grace: Duration,
    capture: Arc<Capture>,
    busy: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Default for Cli {
    fn default() -> Self {
        Self::new(Some(b'\n'))
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Cli {
    /// `delimiter` of `None` reads raw fixed-size blocks instead of lines.
    pub fn new(delimiter: Option<u8>) -> Self {
        Self {
            delimiter,
            kill_grace: DEFAULT_KILL_GRACE,
            capture: Arc::new(Capture::default()),
            busy: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Requests termination of the running command. No-op when idle.
    pub fn terminate(&self) {
        self.current_token().cancel();
    }

    pub async fn execute(&self, command: &str) -> CommandResult {
        self.execute_with_limit(command, 0).await
    }

    pub async fn execute_with_limit(&self, command: &str, max_output_lines: usize) -> CommandResult {
        let argv = match shell_words::split(command) {
            Ok(argv) => argv,
            Err(err) => return failed_result(command, format!("invalid command: {err}")),
        };
        let options = RunOptions {
            max_output_lines,
            cancellable: true,
            ..RunOptions::default()
        };
        self.run(Invocation::Argv(argv), command, options).await
    }

    pub async fn shell(&self, command: &str) -> CommandResult {
        self.shell_with_limit(command, 0).await
    }

    pub async fn shell_with_limit(&self, command: &str, max_output_lines: usize) -> CommandResult {
        let options = RunOptions {
            max_output_lines,
            ..RunOptions::default()
        };
        self.run(Invocation::Shell(command.to_string()), command, options)
            .await
    }

    /// Runs `invocation`, reporting it as `label` in the result. A call
    /// made while another run is in flight returns immediately with a
    /// failed result whose trace is [`BUSY_TRACE`].
    pub async fn run(
        &self,
        invocation: Invocation,
        label: &str,
        options: RunOptions,
    ) -> CommandResult {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(command = %label, "handler busy, run skipped");
            return failed_result(label, BUSY_TRACE);
        }
        let _guard = BusyGuard(&self.busy);
        let cancel = self.reset_token();
        match self.spawn_and_wait(invocation, label, &options, cancel).await {
            Ok(outcome) => build_result(label, outcome),
            Err(err) => {
                tracing::warn!(command = %label, error = %err, "command failed to run");
                failed_result(label, format!("{err:#}"))
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        invocation: Invocation,
        label: &str,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let mut cmd = match &invocation {
            Invocation::Argv(argv) => {
                let (program, args) = argv.split_first().context("empty command")?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            Invocation::Shell(raw) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(raw);
                cmd
            }
        };
        cmd.envs(options.envs.iter().map(|(key, value)| (key, value)));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        apply_process_group(&mut cmd);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {label}"))?;

        let now = Local::now().format("%Y/%m/%d %H:%M:%S");
        self.capture.begin(format!("<{now}> {label}\n"));

        let overflow = CancellationToken::new();
        let stdout = child.stdout.take().context("missing stdout")?;
        let stderr = child.stderr.take().context("missing stderr")?;
        let stdout_task = tokio::spawn(read_stream_chunks(
            stdout,
            Stream::Stdout,
            self.delimiter,
            Arc::clone(&self.capture),
            options.max_output_lines,
            overflow.clone(),
        ));
        let stderr_task = tokio::spawn(read_stream_chunks(
            stderr,
            Stream::Stderr,
            self.delimiter,
            Arc::clone(&self.capture),
            options.max_output_lines,
            overflow.clone(),
        ));

        let mut terminated = false;
        let mut truncated = false;
        let status = tokio::select! {
            status = child.wait() => Some(status.context("wait on child")?),
            _ = cancel.cancelled(), if options.cancellable => {
                terminated = true;
                terminate_child(&mut child, self.kill_grace).await
            }
            _ = overflow.cancelled() => {
                truncated = true;
                terminate_child(&mut child, self.kill_grace).await
            }
        };

        stdout_task
            .await
            .context("stdout task join")?
            .context("stdout read")?;
        stderr_task
            .await
            .context("stderr task join")?
            .context("stderr read")?;
        if overflow.is_cancelled() {
            truncated = true;
        }

        let (stdout_lines, stderr_lines) = self.capture.lines();
        Ok(RunOutcome {
            return_code: status.and_then(|status| status.code()),
            stdout_lines,
            stderr_lines,
            terminated,
            truncated,
        })
    }

    pub fn clear_buffers(&self) {
        self.capture.clear();
    }

    /// Attaches `observer` to stdout after replaying what was captured.
    pub fn register_stdout(&self, observer: Arc<dyn Observer>) -> ObserverId {
        self.capture.register(Stream::Stdout, observer)
    }

    pub fn register_stderr(&self, observer: Arc<dyn Observer>) -> ObserverId {
        self.capture.register(Stream::Stderr, observer)
    }

    pub fn release_stdout(&self, id: ObserverId) {
        self.capture.release(Stream::Stdout, id);
    }

    pub fn release_stderr(&self, id: ObserverId) {
        self.capture.release(Stream::Stderr, id);
    }

    /// Attaches to both streams; release with [`Cli::release`].
    pub fn register(&self, observer: Arc<dyn Observer>) -> (ObserverId, ObserverId) {
        let stdout = self.register_stdout(Arc::clone(&observer));
        let stderr = self.register_stderr(observer);
        (stdout, stderr)
    }

    pub fn release(&self, ids: (ObserverId, ObserverId)) {
        self.release_stdout(ids.0);
        self.release_stderr(ids.1);
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn reset_token(&self) -> CancellationToken {
        let mut slot = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = CancellationToken::new();
        slot.clone()
    }
}
