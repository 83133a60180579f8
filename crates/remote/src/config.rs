use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

/// Key/value lines of one `Host` block, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostBlock {
    entries: Vec<(String, String)>,
}

impl HostBlock {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

pub type HostMap = BTreeMap<String, HostBlock>;

/// Persistence for the host registry.
pub trait HostStore: Send + Sync {
    fn load_all(&self) -> anyhow::Result<HostMap>;
    fn upsert(&self, host: &str, block: HostBlock) -> anyhow::Result<()>;
    /// Returns whether an entry was removed.
    fn delete(&self, host: &str) -> anyhow::Result<bool>;
}

/// An OpenSSH client config file. Every mutation re-reads the file and
/// rewrites it whole under one lock, through a temporary file and rename.
pub struct OpenSshConfigFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OpenSshConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn modify<T>(&self, apply: impl FnOnce(&mut HostMap) -> T) -> anyhow::Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut hosts = self.load_all()?;
        let outcome = apply(&mut hosts);
        self.write_all(&hosts)?;
        Ok(outcome)
    }

    fn write_all(&self, hosts: &HostMap) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, render_config(hosts))
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl HostStore for OpenSshConfigFile {
    fn load_all(&self) -> anyhow::Result<HostMap> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(parse_config(&raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HostMap::new()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    fn upsert(&self, host: &str, block: HostBlock) -> anyhow::Result<()> {
        self.modify(|hosts| {
            hosts.insert(host.to_string(), block);
        })
    }

    fn delete(&self, host: &str) -> anyhow::Result<bool> {
        self.modify(|hosts| hosts.remove(host).is_some())
    }
}

pub fn parse_config(raw: &str) -> HostMap {
    let mut hosts = HostMap::new();
    let mut current: Option<String> = None;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, ""),
        };
        if key.eq_ignore_ascii_case("Host") {
            let name = value.replace('"', "");
            hosts.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        match current.as_ref().and_then(|name| hosts.get_mut(name)) {
            Some(block) => block.set(key, value),
            None => tracing::warn!(line = %line, "ssh config line outside a Host block ignored"),
        }
    }
    hosts
}

pub fn render_config(hosts: &HostMap) -> String {
    let mut out = String::new();
    for (host, block) in hosts {
        out.push_str(&format!("Host {host}\n"));
        for (key, value) in block.entries() {
            out.push_str(&format!("    {key} {value}\n"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn parses_blocks_and_skips_comments() {
        let raw = "# managed\nHost \"backup1\"\n    HostName 10.0.0.5\n    User root\n\nHost web\n  HostName web.lan\n";
        let hosts = parse_config(raw);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["backup1"].get("HostName"), Some("10.0.0.5"));
        assert_eq!(hosts["backup1"].get("user"), Some("root"));
        assert_eq!(hosts["web"].get("HostName"), Some("web.lan"));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = temp_dir("snapdeck-config-missing");
        let store = OpenSshConfigFile::new(dir.join("config"));
        assert!(store.load_all().expect("load").is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn upsert_then_reload_round_trips() {
        let dir = temp_dir("snapdeck-config");
        let store = OpenSshConfigFile::new(dir.join("config"));
        let mut block = HostBlock::default();
        block.set("HostName", "10.0.0.5");
        block.set("User", "root");
        store.upsert("backup1", block.clone()).expect("upsert");
        let mut other = HostBlock::default();
        other.set("HostName", "10.0.0.6");
        store.upsert("backup2", other).expect("upsert");

        let reread = OpenSshConfigFile::new(dir.join("config"));
        let hosts = reread.load_all().expect("load");
        assert_eq!(hosts["backup1"], block);
        assert_eq!(hosts["backup2"].get("HostName"), Some("10.0.0.6"));

        assert!(store.delete("backup1").expect("delete"));
        assert!(!store.delete("backup1").expect("delete again"));
        let hosts = store.load_all().expect("load");
        assert_eq!(hosts.keys().collect::<Vec<_>>(), vec!["backup2"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn renders_openssh_syntax() {
        let mut block = HostBlock::default();
        block.set("HostName", "10.0.0.5");
        block.set("IdentitiesOnly", "yes");
        let hosts = HostMap::from([("backup1".to_string(), block)]);
        assert_eq!(
            render_config(&hosts),
            "Host backup1\n    HostName 10.0.0.5\n    IdentitiesOnly yes\n\n"
        );
    }
}
