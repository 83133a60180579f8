use std::path::{Path, PathBuf};

use anyhow::Context;
use system_utils::process::run_checked;
use tokio::process::Command;
use tokio::time::Duration;

pub const PRIVATE_KEY: &str = "id_rsa";
pub const PUBLIC_KEY: &str = "id_rsa.pub";

const KEYGEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Makes sure `dir` holds an RSA keypair, generating one if either half
/// is missing. Returns the private key path.
pub async fn ensure_keypair(dir: &Path) -> anyhow::Result<PathBuf> {
    let private = dir.join(PRIVATE_KEY);
    let public = dir.join(PUBLIC_KEY);
    if private.is_file() && public.is_file() {
        return Ok(private);
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    for stale in [&private, &public] {
        if stale.exists() {
            tokio::fs::remove_file(stale)
                .await
                .with_context(|| format!("failed to remove {}", stale.display()))?;
        }
    }
    tracing::info!(dir = %dir.display(), "generating ssh keypair");
    let mut cmd = Command::new("ssh-keygen");
    cmd.args(["-q", "-t", "rsa", "-N", "", "-f"]).arg(&private);
    run_checked(&mut cmd, KEYGEN_TIMEOUT, "ssh-keygen").await?;
    Ok(private)
}

pub async fn public_key(dir: &Path) -> anyhow::Result<String> {
    ensure_keypair(dir).await?;
    let path = dir.join(PUBLIC_KEY);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}
