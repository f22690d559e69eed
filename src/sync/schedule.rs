use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::future::join_all;
use thiserror::Error;
use tokio::{sync::mpsc::UnboundedSender, task::spawn_blocking};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::task::{Outcome, SyncResult, SyncTask};
use crate::{
    progress::ProgressEvent,
    remote::{
        error::ConnectError,
        pool::{ConnectionPair, ConnectionPool},
    },
};

/// Work done for every task of a chunk, on the chunk's own connection.
pub trait ChunkRunner: Send + Sync + 'static {
    fn run_task(&self, task: &SyncTask, conn: &ConnectionPair) -> Outcome;

    /// Called once after the last task of a chunk while the connection is still held.
    fn finish_chunk(&self, _results: &[SyncResult], _conn: &ConnectionPair) {}
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("could not start a batch of {tasks} task(s): {source}")]
    Acquire {
        tasks: usize,
        #[source]
        source: ConnectError,
    },
}

/// Split `items` into `min(k, len)` contiguous chunks whose sizes differ by at most one.
pub fn partition<T>(items: Vec<T>, k: usize) -> Vec<Vec<T>> {
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let chunks = k.clamp(1, total);
    let (base, extra) = (total / chunks, total % chunks);
    let mut items = items.into_iter();

    (0..chunks)
        .map(|index| {
            let size = base + usize::from(index < extra);
            items.by_ref().take(size).collect()
        })
        .collect()
}

pub struct ChunkScheduler {
    pool: Arc<ConnectionPool>,
    concurrency: usize,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl ChunkScheduler {
    pub fn new(pool: Arc<ConnectionPool>, concurrency: usize) -> Self {
        Self {
            pool,
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run `batch` in chunks, each chunk serially on its own connection pair.
    ///
    /// Returns one result per task in batch order. Only failing to connect before any task
    /// started is an error; everything after that is reported per task.
    pub async fn run<R>(&self, batch: Vec<SyncTask>, runner: Arc<R>) -> Result<Vec<SyncResult>, ScheduleError>
    where
        R: ChunkRunner + ?Sized,
    {
        let total = batch.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let batch_id = Uuid::now_v7();
        // A batch reserves one session per chunk, and the pool never holds more than its cap.
        let chunks = partition(batch, self.concurrency.min(self.pool.cap()));
        info!(batch = %batch_id, tasks = total, chunks = chunks.len(), "starting batch");

        let connections = self.acquire(batch_id, chunks.len()).await.map_err(|source| {
            ScheduleError::Acquire {
                tasks: total,
                source,
            }
        })?;

        let observer = Arc::new(Observer {
            batch: batch_id,
            total,
            done: AtomicUsize::new(0),
            progress: self.progress.clone(),
        });
        observer.send(ProgressEvent::Started {
            batch: batch_id,
            total,
        });

        let workers = chunks.into_iter().zip(connections).map(|(tasks, conn)| {
            let fallback = tasks.clone();
            let runner = runner.clone();
            let observer = observer.clone();
            let worker = spawn_blocking(move || run_chunk(tasks, conn, &*runner, &observer));

            async move {
                worker.await.unwrap_or_else(|err| {
                    error!(batch = %batch_id, "chunk worker died: {err}");
                    fallback
                        .into_iter()
                        .map(|task| SyncResult::new(task, Outcome::Failed(format!("chunk worker died: {err}"))))
                        .collect()
                })
            }
        });

        let results: Vec<SyncResult> = join_all(workers).await.into_iter().flatten().collect();

        let failed = results.iter().filter(|result| result.outcome.is_failed()).count();
        info!(batch = %batch_id, tasks = total, failed, "batch finished");
        observer.send(ProgressEvent::Finished {
            batch: batch_id,
            results: results.clone(),
        });

        Ok(results)
    }

    /// One pair per chunk, opened concurrently once the batch holds a session slot for
    /// each. Nothing is kept unless every chunk got one.
    async fn acquire(&self, batch: Uuid, count: usize) -> Result<Vec<ConnectionPair>, ConnectError> {
        let reservation = self.pool.reserve(count, &format!("batch {batch}")).await?;

        let attempts = (0..count).map(|index| {
            let reservation = reservation.clone();
            let tag = format!("batch {batch} chunk {index}");

            async move {
                let fallback_tag = tag.clone();
                spawn_blocking(move || reservation.acquire_both(&tag))
                    .await
                    .unwrap_or_else(|err| Err(ConnectError::new(&fallback_tag, err)))
            }
        });

        join_all(attempts).await.into_iter().collect()
    }
}

struct Observer {
    batch: Uuid,
    total: usize,
    done: AtomicUsize,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl Observer {
    fn task_done(&self, result: &SyncResult) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(ProgressEvent::TaskDone {
            batch: self.batch,
            done,
            total: self.total,
            result: result.clone(),
        });
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            // Nobody listening is fine.
            let _ = progress.send(event);
        }
    }
}

fn run_chunk<R>(tasks: Vec<SyncTask>, conn: ConnectionPair, runner: &R, observer: &Observer) -> Vec<SyncResult>
where
    R: ChunkRunner + ?Sized,
{
    let mut results = Vec::with_capacity(tasks.len());

    for task in tasks {
        let outcome = if conn.is_closed() {
            Outcome::Cancelled
        } else {
            match runner.run_task(&task, &conn) {
                Outcome::Failed(_) if conn.is_closed() => Outcome::Cancelled,
                outcome => outcome,
            }
        };

        debug!(conn = %conn.shell().id(), "{} {}: {outcome}", task.kind, task.remote_path);
        let result = SyncResult::new(task, outcome);
        observer.task_done(&result);
        results.push(result);
    }

    if !conn.is_closed() {
        runner.finish_chunk(&results, &conn);
    }

    results
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Mutex, time::Duration};

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        remote::{pool::ConnectionId, testing::LocalConnector, transfer::RemoteMutator},
        sync::{path::RemotePath, task::ChangeKind},
    };

    fn task(name: &str) -> SyncTask {
        SyncTask::new(
            &std::path::Path::new("/repo").join(name),
            RemotePath::new(format!("/remote/{name}")),
            "repo",
            ChangeKind::Modify,
            false,
        )
    }

    /// Records which connection ran which task, in execution order.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ConnectionId, String)>>,
    }

    impl ChunkRunner for Recorder {
        fn run_task(&self, task: &SyncTask, conn: &ConnectionPair) -> Outcome {
            self.seen
                .lock()
                .unwrap()
                .push((conn.shell().id(), task.remote_path.to_string()));
            Outcome::Synced
        }
    }

    #[test]
    fn partition_is_total_and_order_preserving() {
        for total in 0..30 {
            for k in 1..10 {
                let items: Vec<usize> = (0..total).collect();
                let chunks = partition(items.clone(), k);

                assert_eq!(chunks.len(), k.min(total));
                assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), total);
                assert_eq!(chunks.concat(), items);

                let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
                if let (Some(max), Some(min)) = (sizes.iter().max(), sizes.iter().min()) {
                    assert!(max - min <= 1, "{sizes:?}");
                }
            }
        }
    }

    #[tokio::test]
    async fn every_task_gets_exactly_one_result() {
        let connector = LocalConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector.clone()), 8);
        let scheduler = ChunkScheduler::new(pool.clone(), 3);
        let runner = Arc::new(Recorder::default());
        let batch: Vec<SyncTask> = (0..10).map(|i| task(&format!("f{i}.js"))).collect();

        let results = scheduler.run(batch.clone(), runner.clone()).await.unwrap();

        assert_eq!(results.len(), 10);
        assert!(results.iter().zip(&batch).all(|(result, task)| &result.task == task));
        assert_eq!(connector.connects(), 3);
        assert_eq!(pool.live_connections(), 0);

        // Each connection ran a contiguous slice of the batch, in order.
        let seen = runner.seen.lock().unwrap().clone();
        for id in seen.iter().map(|(id, _)| *id).collect::<std::collections::BTreeSet<_>>() {
            let paths: Vec<&String> = seen.iter().filter(|(conn, _)| *conn == id).map(|(_, p)| p).collect();
            let start = batch.iter().position(|t| t.remote_path.to_string() == *paths[0]).unwrap();
            for (offset, path) in paths.iter().enumerate() {
                assert_eq!(batch[start + offset].remote_path.to_string(), **path);
            }
        }
    }

    #[tokio::test]
    async fn add_and_remove_run_in_two_chunks() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        fs::write(local.path().join("a.js"), "a").unwrap();
        fs::write(remote.path().join("b.js"), "b").unwrap();

        let connector = LocalConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector.clone()), 8);
        let remote_of = |name: &str| RemotePath::new(remote.path().join(name).to_string_lossy());
        let batch = vec![
            SyncTask::new(&local.path().join("a.js"), remote_of("a.js"), "repo", ChangeKind::Add, false),
            SyncTask::new(&local.path().join("b.js"), remote_of("b.js"), "repo", ChangeKind::Remove, false),
        ];

        let results = ChunkScheduler::new(pool, 2)
            .run(batch, Arc::new(RemoteMutator::default()))
            .await
            .unwrap();

        let outcomes: Vec<&Outcome> = results.iter().map(|result| &result.outcome).collect();
        assert_eq!(outcomes, [&Outcome::Synced, &Outcome::Deleted]);
        assert_eq!(connector.connects(), 2);
        assert!(remote.path().join("a.js").exists());
        assert!(!remote.path().join("b.js").exists());
    }

    #[tokio::test]
    async fn close_all_mid_batch_cancels_pending_tasks() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let batch: Vec<SyncTask> = (0..4)
            .map(|i| {
                let name = format!("f{i}.js");
                fs::write(local.path().join(&name), "x").unwrap();
                SyncTask::new(
                    &local.path().join(&name),
                    RemotePath::new(remote.path().join(&name).to_string_lossy()),
                    "repo",
                    ChangeKind::Add,
                    false,
                )
            })
            .collect();

        let connector = LocalConnector::new();
        connector.stall_puts(true);
        let pool = ConnectionPool::new(Arc::new(connector.clone()), 4);
        let scheduler = ChunkScheduler::new(pool.clone(), 2);

        let running = tokio::spawn(async move { scheduler.run(batch, Arc::new(RemoteMutator::default())).await });

        while connector.puts_started() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.close_all(), 4);

        let results = running.await.unwrap().unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|result| result.outcome == Outcome::Cancelled));
        assert_eq!(connector.closes(), 2);

        connector.stall_puts(false);
        let fresh = pool.acquire_both("after killall").unwrap();
        assert!(!fresh.is_closed());
    }

    #[tokio::test]
    async fn overlapping_batches_queue_instead_of_evicting_each_other() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let uploads = |prefix: &str| -> Vec<SyncTask> {
            (0..2)
                .map(|i| {
                    let name = format!("{prefix}{i}.js");
                    fs::write(local.path().join(&name), &name).unwrap();
                    SyncTask::new(
                        &local.path().join(&name),
                        RemotePath::new(remote.path().join(&name).to_string_lossy()),
                        prefix,
                        ChangeKind::Add,
                        false,
                    )
                })
                .collect()
        };
        let (first_batch, second_batch) = (uploads("a"), uploads("b"));

        let connector = LocalConnector::new();
        connector.delay_puts(Duration::from_millis(200));
        let pool = ConnectionPool::new(Arc::new(connector.clone()), 2);
        let scheduler = Arc::new(ChunkScheduler::new(pool.clone(), 2));
        let mutator = Arc::new(RemoteMutator::default());

        let first = tokio::spawn({
            let (scheduler, mutator) = (scheduler.clone(), mutator.clone());
            async move { scheduler.run(first_batch, mutator).await }
        });
        while connector.puts_started() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = tokio::spawn({
            let (scheduler, mutator) = (scheduler.clone(), mutator.clone());
            async move { scheduler.run(second_batch, mutator).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.live_sessions() <= 2);

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(first.iter().chain(&second).all(|result| result.outcome == Outcome::Synced));
        assert_eq!(connector.aborts(), 0);
        assert_eq!(connector.connects(), 4);
        for name in ["a0.js", "a1.js", "b0.js", "b1.js"] {
            assert!(remote.path().join(name).exists(), "{name}");
        }
    }

    #[tokio::test]
    async fn failed_acquisition_fails_the_batch_and_keeps_nothing() {
        let connector = LocalConnector::new();
        connector.fail_connects(true);
        let pool = ConnectionPool::new(Arc::new(connector.clone()), 4);

        let result = ChunkScheduler::new(pool.clone(), 2)
            .run(vec![task("a.js"), task("b.js")], Arc::new(Recorder::default()))
            .await;

        assert!(matches!(result, Err(ScheduleError::Acquire { tasks: 2, .. })));
        assert_eq!(pool.live_connections(), 0);
    }

    #[tokio::test]
    async fn progress_is_reported_per_task() {
        let pool = ConnectionPool::new(Arc::new(LocalConnector::new()), 4);
        let (tx, mut rx) = unbounded_channel();
        let scheduler = ChunkScheduler::new(pool, 2).with_progress(tx);

        scheduler
            .run(vec![task("a"), task("b"), task("c")], Arc::new(Recorder::default()))
            .await
            .unwrap();
        drop(scheduler);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(matches!(events.first(), Some(ProgressEvent::Started { total: 3, .. })));
        let ticks: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::TaskDone { done, .. } => Some(*done),
                _ => None,
            })
            .collect();
        assert_eq!(ticks.len(), 3);
        assert!(ticks.contains(&3));
        assert!(matches!(events.last(), Some(ProgressEvent::Finished { results, .. }) if results.len() == 3));
    }
}
