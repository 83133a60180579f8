use std::path::{Path, PathBuf};

/// Expands a leading `~` to `$HOME`; other paths are returned unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    let Ok(home) = std::env::var("HOME") else {
        return path.to_path_buf();
    };
    if raw == "~" {
        return PathBuf::from(home);
    }
    match raw.strip_prefix("~/") {
        Some(rest) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
