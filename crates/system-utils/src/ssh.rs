use anyhow::Context;
use std::path::{Path, PathBuf};

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s' \"$SNAPDECK_SSH_PASS\"\n";
const ASKPASS_FILE: &str = "ssh-askpass.sh";

/// Environment that makes ssh read its password from `password` without a tty.
pub fn askpass_env(dir: &Path, password: &str) -> anyhow::Result<Vec<(String, String)>> {
    let script = ensure_askpass_script(dir)?;
    Ok(vec![
        ("SNAPDECK_SSH_PASS".to_string(), password.to_string()),
        ("SSH_ASKPASS".to_string(), script.to_string_lossy().to_string()),
        ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
        ("DISPLAY".to_string(), "1".to_string()),
    ])
}

pub fn ensure_askpass_script(dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(ASKPASS_FILE);
    let mut needs_write = true;
    if let Ok(existing) = std::fs::read(&path) {
        if existing == ASKPASS_SCRIPT.as_bytes() {
            needs_write = false;
        }
    }
    if needs_write {
        std::fs::write(&path, ASKPASS_SCRIPT)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(&path, perms)?;
    }
    Ok(path)
}
