//! Snapshot operations rendered to `zfs` command lines.
//!
//! Rendering is fixed: the recursive flag occupies one slot that is
//! either ` -r` or a single space, so a non-recursive command carries two
//! spaces before its first operand.

use protocol::TaskAction;

pub const DEFAULT_HOLD_TAG: &str = "keep";

pub trait SnapshotCommand {
    fn action(&self) -> TaskAction;
    fn command(&self) -> String;
}

fn recursive_flag(recursive: bool) -> &'static str {
    if recursive {
        " -r"
    } else {
        " "
    }
}

fn render(verb: &str, recursive: bool, operands: &[&str]) -> String {
    let mut command = format!("zfs {verb}{}", recursive_flag(recursive));
    for operand in operands {
        command.push(' ');
        command.push_str(operand);
    }
    command
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCreate {
    pub name: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDestroy {
    pub name: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRename {
    pub name: String,
    pub new_name: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHold {
    pub name: String,
    pub tag: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRelease {
    pub name: String,
    pub tag: String,
    pub recursive: bool,
}

impl SnapshotHold {
    pub fn keep(name: impl Into<String>, recursive: bool) -> Self {
        Self {
            name: name.into(),
            tag: DEFAULT_HOLD_TAG.to_string(),
            recursive,
        }
    }
}

impl SnapshotRelease {
    pub fn keep(name: impl Into<String>, recursive: bool) -> Self {
        Self {
            name: name.into(),
            tag: DEFAULT_HOLD_TAG.to_string(),
            recursive,
        }
    }
}

impl SnapshotCommand for SnapshotCreate {
    fn action(&self) -> TaskAction {
        TaskAction::Create
    }

    fn command(&self) -> String {
        render("snapshot", self.recursive, &[&self.name])
    }
}

impl SnapshotCommand for SnapshotDestroy {
    fn action(&self) -> TaskAction {
        TaskAction::Destroy
    }

    fn command(&self) -> String {
        render("destroy", self.recursive, &[&self.name])
    }
}

impl SnapshotCommand for SnapshotRename {
    fn action(&self) -> TaskAction {
        TaskAction::Rename
    }

    fn command(&self) -> String {
        render("rename", self.recursive, &[&self.name, &self.new_name])
    }
}

impl SnapshotCommand for SnapshotHold {
    fn action(&self) -> TaskAction {
        TaskAction::Hold
    }

    fn command(&self) -> String {
        render("hold", self.recursive, &[&self.tag, &self.name])
    }
}

impl SnapshotCommand for SnapshotRelease {
    fn action(&self) -> TaskAction {
        TaskAction::Release
    }

    fn command(&self) -> String {
        render("release", self.recursive, &[&self.tag, &self.name])
    }
}
