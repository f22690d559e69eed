use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::{
    adapter::fs::{list_local_files, IgnoreRules},
    remote::{
        command::{NoiseFilter, RemoteCommand},
        pool::ConnectionPool,
        transfer::RemoteMutator,
    },
    sync::{
        path::{PathResolver, RemotePath},
        schedule::ChunkScheduler,
        task::{ChangeKind, SyncResult, SyncTask},
    },
};

/// Make the remote copy of `repo` equal to the local one.
///
/// Remote files without a local counterpart are deleted first, in their own batch; then
/// every local file is compared and uploaded when it differs. When other repositories
/// deploy into the same remote tree, nothing is deleted: their files would look orphaned.
pub async fn sync_repo(
    repo: &str,
    resolver: &PathResolver,
    rules: &IgnoreRules,
    scheduler: &ChunkScheduler,
    mutator: Arc<RemoteMutator>,
) -> Result<Vec<SyncResult>> {
    let mapping = resolver.mapping(repo)?;
    let remote_root = mapping.remote_root.clone();

    let local_files = {
        let rules = rules.clone();
        spawn_blocking(move || list_local_files(&rules)).await??
    };
    let uploads = local_files
        .iter()
        .map(|path| resolver.resolve_full_sync(repo, path))
        .collect::<Result<Vec<_>, _>>()?;

    let remote_files = list_remote_files(scheduler.pool(), repo, &remote_root, mutator.noise()).await?;
    let expected: HashSet<&RemotePath> = uploads.iter().map(|task| &task.remote_path).collect();

    let neighbours = resolver.overlapping_repos(repo);
    let orphans: Vec<SyncTask> = if neighbours.is_empty() {
        remote_files
            .iter()
            .filter(|remote| !expected.contains(remote))
            .filter_map(|remote| {
                let local = resolver.local_counterpart(repo, remote)?;
                (!rules.is_ignored(&local, false))
                    .then(|| SyncTask::new(&local, remote.clone(), repo, ChangeKind::Remove, true))
            })
            .collect()
    } else {
        warn!(
            repo,
            root = %remote_root,
            shared_with = ?neighbours,
            "remote root is shared, leaving files without a local counterpart in place"
        );
        Vec::new()
    };

    info!(
        repo,
        local = uploads.len(),
        remote = remote_files.len(),
        orphans = orphans.len(),
        "full sync"
    );

    let mut results = scheduler
        .run(orphans, mutator.clone())
        .await
        .context("Could not delete orphaned remote files")?;
    results.extend(
        scheduler
            .run(uploads, mutator)
            .await
            .context("Could not upload local files")?,
    );

    Ok(results)
}

/// Every file below `root` on the remote host. A missing root lists as empty.
async fn list_remote_files(
    pool: &Arc<ConnectionPool>,
    repo: &str,
    root: &RemotePath,
    noise: &NoiseFilter,
) -> Result<Vec<RemotePath>> {
    let tag = format!("full sync {repo}");
    let reservation = pool.reserve(1, &tag).await?;
    let command = RemoteCommand::ListFiles(root.clone());
    let noise = noise.clone();

    let output = spawn_blocking(move || -> Result<_> {
        let shell = reservation.acquire_shell(&tag)?;
        Ok(command.run(&shell, &noise)?)
    })
    .await??;

    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(RemotePath::new)
        .collect())
}
