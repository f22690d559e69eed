use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use super::fs::IgnoreRules;
use crate::sync::task::{ChangeEvent, ChangeKind};

/// Keeps the OS watch on one repository alive for as long as it is held.
pub struct RepoWatcher {
    repo: String,
    _watcher: RecommendedWatcher,
}

impl RepoWatcher {
    pub fn repo(&self) -> &str {
        &self.repo
    }
}

/// Watch `rules.root()` recursively, forwarding every change that is not ignored.
pub fn watch_repo(repo: &str, rules: IgnoreRules, events: UnboundedSender<ChangeEvent>) -> Result<RepoWatcher> {
    let root = rules.root().to_path_buf();
    let tag = repo.to_string();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in translate(&tag, event) {
                if rules.is_ignored(&change.local_path, change.kind.is_dir_op()) {
                    continue;
                }
                // The receiver is gone only while shutting down.
                let _ = events.send(change);
            }
        }
        Err(err) => warn!(repo = %tag, "watch error: {err}"),
    })
    .context("Could not create a file watcher")?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("Could not watch {}", root.display()))?;
    info!(repo, root = %root.display(), "watching");

    Ok(RepoWatcher {
        repo: repo.to_string(),
        _watcher: watcher,
    })
}

/// Convert a notify event into zero or more change events.
///
/// A removal whose kind the platform does not report becomes `RemoveDir`; `rm -rf` is
/// correct for files as well.
pub fn translate(repo: &str, event: Event) -> Vec<ChangeEvent> {
    let change = |path: PathBuf, kind| ChangeEvent::new(path, repo, kind);

    match event.kind {
        EventKind::Create(CreateKind::File) => event
            .paths
            .into_iter()
            .map(|path| change(path, ChangeKind::Add))
            .collect(),
        EventKind::Create(CreateKind::Folder) => event
            .paths
            .into_iter()
            .map(|path| change(path, ChangeKind::AddDir))
            .collect(),
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .map(|path| {
                let kind = appeared(&path);
                change(path, kind)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let mut paths = event.paths.into_iter();
            let (Some(from), Some(to)) = (paths.next(), paths.next()) else {
                return Vec::new();
            };
            let kind = appeared(&to);

            vec![change(from, ChangeKind::RemoveDir), change(to, kind)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .into_iter()
            .map(|path| change(path, ChangeKind::RemoveDir))
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .into_iter()
            .map(|path| {
                let kind = if path.exists() {
                    appeared(&path)
                } else {
                    ChangeKind::RemoveDir
                };
                change(path, kind)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any) => event
            .paths
            .into_iter()
            .filter(|path| !path.is_dir())
            .map(|path| change(path, ChangeKind::Modify))
            .collect(),
        EventKind::Remove(RemoveKind::File) => event
            .paths
            .into_iter()
            .map(|path| change(path, ChangeKind::Remove))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|path| change(path, ChangeKind::RemoveDir))
            .collect(),
        _ => Vec::new(),
    }
}

fn appeared(path: &Path) -> ChangeKind {
    if path.is_dir() {
        ChangeKind::AddDir
    } else {
        ChangeKind::Add
    }
}
