//! Remote execution over the OpenSSH client.

pub mod config;
pub mod keys;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use protocol::CommandResult;
use runner::{Cli, Invocation, RunOptions};
use system_utils::ssh::askpass_env;

use self::config::{HostBlock, HostStore, OpenSshConfigFile};

pub const CONFIG_FILE: &str = "config";

/// A profile directory: the ssh config shared by every host plus the
/// keypair used to reach them.
pub struct Profile {
    dir: PathBuf,
    store: Arc<dyn HostStore>,
}

impl Profile {
    /// Uses `<dir>/config` as the host store.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let store = Arc::new(OpenSshConfigFile::new(dir.join(CONFIG_FILE)));
        Self { dir, store }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(keys::PRIVATE_KEY)
    }

    pub fn store(&self) -> &dyn HostStore {
        self.store.as_ref()
    }

    /// Configured host names; a missing config yields none.
    pub fn hosts(&self) -> Vec<String> {
        match self.store.load_all() {
            Ok(hosts) => hosts.into_keys().collect(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read ssh config");
                Vec::new()
            }
        }
    }

    pub async fn public_key(&self) -> anyhow::Result<String> {
        keys::public_key(&self.dir).await
    }
}

/// Connection details for upserting a host.
#[derive(Debug, Clone, Default)]
pub struct HostSpec {
    pub host: String,
    pub hostname: String,
    pub username: String,
    pub password: Option<String>,
    pub options: BTreeMap<String, String>,
}

/// One named remote host. Commands are prefixed with
/// `ssh -F <profile config> <host>` and run on the wrapped [`Cli`].
pub struct Ssh {
    host: String,
    hostname: String,
    username: String,
    password: Option<String>,
    profile: Arc<Profile>,
    cli: Cli,
}

impl Ssh {
    /// Writes the host's config entry and returns a connection to it.
    /// Empty `hostname`/`username` keep whatever the config already has.
    pub fn open(profile: Arc<Profile>, spec: HostSpec) -> anyhow::Result<Self> {
        let host = spec.host.replace(' ', "");
        if host.is_empty() {
            anyhow::bail!("host name is empty");
        }
        let existing = profile.store().load_all()?.remove(&host).unwrap_or_default();
        let hostname = pick(spec.hostname, existing.get("HostName"));
        let username = pick(spec.username, existing.get("User"));
        let mut block = HostBlock::default();
        block.set("IdentityFile", profile.key_path().to_string_lossy());
        block.set(
            "PasswordAuthentication",
            if spec.password.is_some() { "yes" } else { "no" },
        );
        block.set("StrictHostKeyChecking", "no");
        block.set("IdentitiesOnly", "yes");
        if !hostname.is_empty() {
            block.set("HostName", &hostname);
        }
        if !username.is_empty() {
            block.set("User", &username);
        }
        for (key, value) in &spec.options {
            block.set(key, value);
        }
        profile
            .store()
            .upsert(&host, block)
            .with_context(|| format!("failed to store host {host}"))?;
        tracing::info!(host = %host, hostname = %hostname, "ssh host configured");
        Ok(Self {
            host,
            hostname,
            username,
            password: spec.password,
            profile,
            cli: Cli::default(),
        })
    }

    /// Connection to a host already present in the profile's config.
    pub fn attach(profile: Arc<Profile>, host: &str) -> anyhow::Result<Self> {
        let block = profile
            .store()
            .load_all()?
            .remove(host)
            .with_context(|| format!("host {host} is not configured"))?;
        Ok(Self {
            host: host.to_string(),
            hostname: block.get("HostName").unwrap_or_default().to_string(),
            username: block.get("User").unwrap_or_default().to_string(),
            password: None,
            profile,
            cli: Cli::default(),
        })
    }

    /// Grace period between the termination signal and SIGKILL when a
    /// command is cancelled.
    pub fn with_kill_grace(mut self, grace: std::time::Duration) -> Self {
        self.cli = Cli::default().with_kill_grace(grace);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn cli(&self) -> &Cli {
        &self.cli
    }

    pub fn is_busy(&self) -> bool {
        self.cli.is_busy()
    }

    pub fn terminate(&self) {
        self.cli.terminate();
    }

    /// Deletes this host's config entry.
    pub fn remove(&self) -> anyhow::Result<()> {
        self.profile.store().delete(&self.host)?;
        tracing::info!(host = %self.host, "ssh host removed");
        Ok(())
    }

    pub fn base_argv(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-F".to_string(),
            self.profile.config_path().to_string_lossy().to_string(),
            self.host.clone(),
        ]
    }

    pub async fn execute(&self, command: &str) -> CommandResult {
        self.execute_with_limit(command, 0).await
    }

    /// Runs `command` on the remote host. The remote command travels as a
    /// single ssh argument, so its quoting is interpreted by the remote shell.
    pub async fn execute_with_limit(&self, command: &str, max_output_lines: usize) -> CommandResult {
        let mut argv = self.base_argv();
        argv.push(command.to_string());
        let options = match self.run_options(max_output_lines) {
            Ok(options) => options,
            Err(err) => return self.setup_failure(command, err),
        };
        let result = self.cli.run(Invocation::Argv(argv), command, options).await;
        self.finish(result)
    }

    /// Installs the profile's public key on the remote host using the
    /// connection's password. Generates the keypair first if needed.
    pub async fn send_key(&self) -> anyhow::Result<CommandResult> {
        let password = self
            .password
            .as_deref()
            .context("a password is required to install the key")?;
        let key_path = keys::ensure_keypair(self.profile.dir()).await?;
        let argv = vec![
            "ssh-copy-id".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-i".to_string(),
            key_path.to_string_lossy().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            format!("{}@{}", self.username, self.hostname),
        ];
        let label = argv.join(" ");
        let options = RunOptions {
            envs: askpass_env(self.profile.dir(), password)?,
            ..RunOptions::default()
        };
        let result = self.cli.run(Invocation::Argv(argv), &label, options).await;
        Ok(self.finish(result))
    }

    fn run_options(&self, max_output_lines: usize) -> anyhow::Result<RunOptions> {
        let envs = match self.password.as_deref() {
            Some(password) => askpass_env(self.profile.dir(), password)?,
            None => Vec::new(),
        };
        Ok(RunOptions {
            max_output_lines,
            envs,
            cancellable: true,
        })
    }

    fn setup_failure(&self, command: &str, err: anyhow::Error) -> CommandResult {
        let mut result = CommandResult::new(command);
        result.name = self.host.clone();
        result.return_code = None;
        result.status = protocol::ResultStatus::Error;
        result.trace = format!("{err:#}");
        result
    }

    fn finish(&self, mut result: CommandResult) -> CommandResult {
        result.name = self.host.clone();
        let stderr = result.stderr();
        if !stderr.is_empty() {
            tracing::warn!(host = %self.host, stderr = %stderr.trim(), "ssh command wrote to stderr");
            if let Some(hint) = ssh_auth_hint(&stderr, self.password.is_some()) {
                if !result.trace.is_empty() {
                    result.trace.push('\n');
                }
                result.trace.push_str(hint);
            }
        }
        result
    }
}

fn pick(explicit: String, stored: Option<&str>) -> String {
    if explicit.is_empty() {
        stored.unwrap_or_default().to_string()
    } else {
        explicit
    }
}

fn ssh_auth_hint(detail: &str, has_password: bool) -> Option<&'static str> {
    let detail = detail.to_lowercase();
    if detail.contains("keyboard-interactive")
        || detail.contains("verification code")
        || detail.contains("two-factor")
    {
        return Some(
            "ssh requires keyboard-interactive/2FA; SSH_ASKPASS cannot answer it. Install the key instead.",
        );
    }
    if detail.contains("permission denied")
        || detail.contains("authentication failed")
        || detail.contains("no supported authentication methods available")
        || detail.contains("too many authentication failures")
    {
        if has_password {
            return Some("ssh password auth failed. Check the password for this host.");
        }
        return Some("ssh key auth failed. Send the public key to this host first.");
    }
    None
}
