use std::io;
use std::time::Duration;

use tokio::process::{Child, Command};

#[cfg(unix)]
pub(crate) fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(crate) fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

/// Asks the process group to terminate, then kills it if it is still
/// running after `grace`.
pub(crate) async fn terminate_child(
    child: &mut Child,
    grace: Duration,
) -> Option<std::process::ExitStatus> {
    signal_group(child, libc::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "process ignored SIGTERM, killing"
            );
            signal_group(child, libc::SIGKILL);
            let _ = child.kill().await;
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => None,
            }
        }
    }
}
