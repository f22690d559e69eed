use std::{
    collections::HashMap,
    fmt::Display,
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::task::{ChangeEvent, ChangeKind, SyncTask};

/// Absolute path on the remote host. Always `/`-separated, whatever the local platform uses.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let raw = path.as_ref().replace('\\', "/");
        let absolute = raw.starts_with('/');
        let joined = raw
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect::<Vec<_>>()
            .join("/");

        match (absolute, joined.is_empty()) {
            (true, _) => Self(format!("/{joined}")),
            (false, true) => Self(".".to_string()),
            (false, false) => Self(joined),
        }
    }

    pub fn join(&self, segment: impl AsRef<str>) -> Self {
        let segment = segment.as_ref();
        if segment.is_empty() {
            return self.clone();
        }

        Self::new(format!("{}/{}", self.0, segment))
    }

    pub fn parent(&self) -> Self {
        match self.0.rsplit_once('/') {
            Some(("", _)) => Self("/".to_string()),
            Some((parent, _)) => Self(parent.to_string()),
            None => Self(".".to_string()),
        }
    }

    /// The part of `self` below `root`, without a leading slash.
    pub fn relative_to(&self, root: &RemotePath) -> Option<&str> {
        if self == root {
            return Some("");
        }

        let rest = self.0.strip_prefix(root.0.as_str())?;
        if root.0 == "/" {
            return Some(rest);
        }

        rest.strip_prefix('/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RemotePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which top-level remote directory a repository is deployed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoCategory {
    Cron,
    Library,
    WebApp,
}

impl RepoCategory {
    pub fn top_dir(&self) -> &'static str {
        match self {
            RepoCategory::Cron => "crons",
            RepoCategory::Library => "includes",
            RepoCategory::WebApp => "www",
        }
    }

    fn default_subpath<'a>(&self, repo: &'a str) -> Option<&'a str> {
        match self {
            RepoCategory::Cron | RepoCategory::WebApp => Some(repo),
            RepoCategory::Library => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("repository `{0}` has no remote mapping")]
    UnknownRepo(String),

    #[error("{path} is not under the `{repo}` root {root}")]
    OutsideRoot {
        repo: String,
        path: PathBuf,
        root: PathBuf,
    },
}

#[derive(Clone, Debug)]
pub struct RepoMapping {
    pub local_root: PathBuf,
    pub remote_root: RemotePath,
    pub strip_segments: usize,
    pub rename: HashMap<String, String>,
}

impl RepoMapping {
    pub fn new(
        remote_base: &RemotePath,
        repo: &str,
        category: RepoCategory,
        subpath: Option<&str>,
        local_root: &Path,
    ) -> Self {
        let subpath = subpath.or(category.default_subpath(repo)).unwrap_or("");

        Self {
            local_root: local_root.to_path_buf(),
            remote_root: remote_base.join(category.top_dir()).join(subpath),
            strip_segments: 0,
            rename: HashMap::new(),
        }
    }

    pub fn with_strip_segments(mut self, strip_segments: usize) -> Self {
        self.strip_segments = strip_segments;
        self
    }

    pub fn with_rename(mut self, rename: HashMap<String, String>) -> Self {
        self.rename = rename;
        self
    }

    fn remote_path(&self, repo: &str, local_path: &Path) -> Result<RemotePath, ResolveError> {
        let relative =
            local_path
                .strip_prefix(&self.local_root)
                .map_err(|_| ResolveError::OutsideRoot {
                    repo: repo.to_string(),
                    path: local_path.to_path_buf(),
                    root: self.local_root.clone(),
                })?;

        let segments: Vec<String> = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(segment) => Some(segment.to_string_lossy().to_string()),
                _ => None,
            })
            .skip(self.strip_segments)
            .map(|segment| self.rename.get(&segment).cloned().unwrap_or(segment))
            .collect();

        Ok(self.remote_root.join(segments.join("/")))
    }
}

/// Maps local paths of watched repositories onto the remote tree. Pure, no I/O.
#[derive(Clone, Debug, Default)]
pub struct PathResolver {
    repos: HashMap<String, RepoMapping>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(mut self, repo: &str, mapping: RepoMapping) -> Self {
        self.repos.insert(repo.to_string(), mapping);
        self
    }

    pub fn mapping(&self, repo: &str) -> Result<&RepoMapping, ResolveError> {
        self.repos
            .get(repo)
            .ok_or_else(|| ResolveError::UnknownRepo(repo.to_string()))
    }

    pub fn remote_path(&self, repo: &str, local_path: &Path) -> Result<RemotePath, ResolveError> {
        self.mapping(repo)?.remote_path(repo, local_path)
    }

    pub fn resolve(&self, event: &ChangeEvent) -> Result<SyncTask, ResolveError> {
        let remote_path = self.remote_path(&event.repo, &event.local_path)?;

        Ok(SyncTask::new(
            &event.local_path,
            remote_path,
            &event.repo,
            event.kind,
            false,
        ))
    }

    pub fn resolve_full_sync(&self, repo: &str, local_path: &Path) -> Result<SyncTask, ResolveError> {
        let remote_path = self.remote_path(repo, local_path)?;

        Ok(SyncTask::new(
            local_path,
            remote_path,
            repo,
            ChangeKind::Modify,
            true,
        ))
    }

    /// Other repositories whose remote root is the same as, inside, or around the root of
    /// `repo`. Library repositories share one remote directory by default.
    pub fn overlapping_repos(&self, repo: &str) -> Vec<&str> {
        let Some(mapping) = self.repos.get(repo) else {
            return Vec::new();
        };

        let mut overlapping: Vec<&str> = self
            .repos
            .iter()
            .filter(|(name, other)| {
                name.as_str() != repo
                    && (other.remote_root.relative_to(&mapping.remote_root).is_some()
                        || mapping.remote_root.relative_to(&other.remote_root).is_some())
            })
            .map(|(name, _)| name.as_str())
            .collect();
        overlapping.sort_unstable();

        overlapping
    }

    /// Where a remote file would live locally. Only used to label orphan deletions, so
    /// stripped segments and renames are not reversed.
    pub fn local_counterpart(&self, repo: &str, remote_path: &RemotePath) -> Option<PathBuf> {
        let mapping = self.repos.get(repo)?;
        let relative = remote_path.relative_to(&mapping.remote_root)?;

        Some(
            relative
                .split('/')
                .filter(|segment| !segment.is_empty())
                .fold(mapping.local_root.clone(), |path, segment| path.join(segment)),
        )
    }
}
