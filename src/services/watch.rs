use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedSender},
    oneshot,
};
use tracing::{debug, warn};

use super::sync_repo::sync_repo;
use crate::{
    adapter::watch::{watch_repo, RepoWatcher},
    config::ConfigContext,
    remote::transfer::RemoteMutator,
    sync::{
        aggregate::{coalesce, drain_batches, spawn_aggregator},
        path::PathResolver,
        schedule::ChunkScheduler,
        task::{ChangeEvent, SyncResult},
    },
};

/// Work queued for one repository.
pub enum SyncJob {
    Changes(Vec<ChangeEvent>),
    FullSync(oneshot::Sender<Result<Vec<SyncResult>>>),
}

impl From<Vec<ChangeEvent>> for SyncJob {
    fn from(events: Vec<ChangeEvent>) -> Self {
        SyncJob::Changes(events)
    }
}

/// One serial job queue per repository. Watcher batches and full syncs of the same
/// repository run one after the other, never side by side.
#[derive(Clone)]
pub struct SyncQueues {
    queues: Arc<BTreeMap<String, UnboundedSender<SyncJob>>>,
}

impl SyncQueues {
    pub fn start(ctx: Arc<ConfigContext>, scheduler: Arc<ChunkScheduler>, mutator: Arc<RemoteMutator>) -> Self {
        let mut queues = BTreeMap::new();

        for repo in ctx.repo_names().map(str::to_string).collect::<Vec<_>>() {
            let (job_tx, job_rx) = unbounded_channel();
            queues.insert(repo.clone(), job_tx);

            let ctx = ctx.clone();
            let scheduler = scheduler.clone();
            let mutator = mutator.clone();
            tokio::spawn(async move {
                drain_batches(&repo, job_rx, |job| {
                    let ctx = ctx.clone();
                    let scheduler = scheduler.clone();
                    let mutator = mutator.clone();
                    let repo = repo.clone();

                    async move { run_job(&ctx, &repo, &scheduler, mutator, job).await }
                })
                .await;
                debug!(repo = %repo, "sync queue stopped");
            });
        }

        Self {
            queues: Arc::new(queues),
        }
    }

    pub fn sender(&self, repo: &str) -> Option<UnboundedSender<SyncJob>> {
        self.queues.get(repo).cloned()
    }

    /// Queue a full sync of `repo` behind whatever that repository is already running.
    pub async fn full_sync(&self, repo: &str) -> Result<Vec<SyncResult>> {
        let queue = self
            .queues
            .get(repo)
            .ok_or_else(|| anyhow!("Repository `{repo}` is not configured"))?;
        let (reply_tx, reply_rx) = oneshot::channel();

        queue
            .send(SyncJob::FullSync(reply_tx))
            .map_err(|_| anyhow!("The sync queue of `{repo}` has stopped"))?;

        reply_rx
            .await
            .with_context(|| format!("The sync queue of `{repo}` dropped the full sync"))?
    }
}

async fn run_job(
    ctx: &ConfigContext,
    repo: &str,
    scheduler: &ChunkScheduler,
    mutator: Arc<RemoteMutator>,
    job: SyncJob,
) -> Result<()> {
    match job {
        SyncJob::Changes(events) => {
            sync_changes(ctx.resolver(), scheduler, mutator, events).await?;
        }
        SyncJob::FullSync(reply) => {
            let result = full_sync(ctx, repo, scheduler, mutator).await;
            if reply.send(result).is_err() {
                debug!(repo, "nobody is waiting for the full sync anymore");
            }
        }
    }

    Ok(())
}

/// Full sync of one configured repository with its ignore rules.
pub async fn full_sync(
    ctx: &ConfigContext,
    repo: &str,
    scheduler: &ChunkScheduler,
    mutator: Arc<RemoteMutator>,
) -> Result<Vec<SyncResult>> {
    let rules = ctx.ignore_rules(repo)?;

    sync_repo(repo, ctx.resolver(), &rules, scheduler, mutator).await
}

/// Start one watcher and aggregator per repository, feeding that repository's queue.
///
/// The returned watchers must be kept alive; dropping one stops its repository's pipeline.
pub fn start_watching(ctx: &ConfigContext, queues: &SyncQueues) -> Result<Vec<RepoWatcher>> {
    let mut watchers = Vec::new();

    for repo in ctx.repo_names() {
        let Some(jobs) = queues.sender(repo) else {
            warn!(repo, "no sync queue, not watching");
            continue;
        };
        let (event_tx, event_rx) = unbounded_channel();

        watchers.push(watch_repo(repo, ctx.ignore_rules(repo)?, event_tx)?);
        spawn_aggregator(repo.to_string(), ctx.debounce(), event_rx, jobs);
    }

    Ok(watchers)
}

/// Resolve a debounced batch of changes and run it. Changes that cannot be mapped are skipped.
pub async fn sync_changes(
    resolver: &PathResolver,
    scheduler: &ChunkScheduler,
    mutator: Arc<RemoteMutator>,
    events: Vec<ChangeEvent>,
) -> Result<Vec<SyncResult>> {
    let tasks = coalesce(events)
        .iter()
        .filter_map(|event| match resolver.resolve(event) {
            Ok(task) => Some(task),
            Err(err) => {
                warn!(repo = %event.repo, "skipping change: {err}");
                None
            }
        })
        .collect();

    Ok(scheduler.run(tasks, mutator).await?)
}
