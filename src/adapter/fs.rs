use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ignore::{
    gitignore::{Gitignore, GitignoreBuilder},
    WalkBuilder,
};
use tracing::debug;

pub const DEFAULT_IGNORE: &str = ".git/\nnode_modules/\nbower_components/\ntmp/\n";

/// gitignore-style rules anchored at a repository root.
#[derive(Clone, Debug)]
pub struct IgnoreRules {
    root: PathBuf,
    matcher: Gitignore,
}

impl IgnoreRules {
    pub fn new(root: &Path, rules: &str) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);

        for line in rules.lines() {
            builder
                .add_line(None, line)
                .with_context(|| format!("Invalid ignore rule {line:?}"))?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            matcher: builder.build().context("Could not build ignore rules")?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths outside the root are never ignored.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if !path.starts_with(&self.root) || path == self.root {
            return false;
        }

        self.matcher
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }
}

/// Every regular file under the rules' root that the rules do not exclude, sorted.
pub fn list_local_files(rules: &IgnoreRules) -> Result<Vec<PathBuf>> {
    let filter = rules.clone();
    let walker = WalkBuilder::new(rules.root())
        .standard_filters(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|kind| kind.is_dir());
            !filter.is_ignored(entry.path(), is_dir)
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Could not walk {}", rules.root().display()))?;

        // None is possible if the entry is stdin
        if entry.file_type().is_some_and(|kind| kind.is_file()) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    debug!(root = %rules.root().display(), files = files.len(), "listed local files");
    Ok(files)
}
