use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use super::path::RemotePath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Modify,
    Remove,
    AddDir,
    RemoveDir,
}

impl ChangeKind {
    /// Directory operations act on the path itself rather than on its parent.
    pub fn is_dir_op(&self) -> bool {
        matches!(self, ChangeKind::AddDir | ChangeKind::RemoveDir)
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, ChangeKind::Add | ChangeKind::Modify)
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ChangeKind::Add => "add",
            ChangeKind::Modify => "change",
            ChangeKind::Remove => "unlink",
            ChangeKind::AddDir => "addDir",
            ChangeKind::RemoveDir => "unlinkDir",
        };

        f.write_str(label)
    }
}

/// A single filesystem change reported by the watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub local_path: PathBuf,
    pub repo: String,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(local_path: impl Into<PathBuf>, repo: &str, kind: ChangeKind) -> Self {
        Self {
            local_path: local_path.into(),
            repo: repo.to_string(),
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncTask {
    pub local_path: PathBuf,
    pub remote_path: RemotePath,
    pub remote_parent_path: RemotePath,
    pub repo: String,
    pub kind: ChangeKind,
    pub is_repo_full_sync: bool,
}

impl SyncTask {
    pub fn new(
        local_path: &Path,
        remote_path: RemotePath,
        repo: &str,
        kind: ChangeKind,
        is_repo_full_sync: bool,
    ) -> Self {
        let remote_parent_path = if kind.is_dir_op() {
            remote_path.clone()
        } else {
            remote_path.parent()
        };

        Self {
            local_path: local_path.to_path_buf(),
            remote_path,
            remote_parent_path,
            repo: repo.to_string(),
            kind,
            is_repo_full_sync,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Synced,
    Skipped,
    Deleted,
    Failed(String),
    Cancelled,
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Synced => f.write_str("synced"),
            Outcome::Skipped => f.write_str("skipped"),
            Outcome::Deleted => f.write_str("deleted"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncResult {
    pub task: SyncTask,
    pub outcome: Outcome,
}

impl SyncResult {
    pub fn new(task: SyncTask, outcome: Outcome) -> Self {
        Self { task, outcome }
    }
}

impl Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.task.kind,
            self.task.local_path.display(),
            self.outcome
        )
    }
}
