use std::{
    collections::BTreeMap,
    fmt::Display,
    io::Read,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use anyhow::anyhow;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{
    error::{ConnectError, TransportError},
    transport::{Connector, ExecOutput, FileChannel, Transport},
};
use crate::sync::path::RemotePath;

/// Opaque handle of a pooled connection. Assigned once at creation, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Ssh,
    Sftp,
}

#[derive(Clone)]
enum Handle {
    Ssh(Arc<dyn Transport>),
    Sftp(Arc<dyn FileChannel>),
}

struct LiveEntry {
    role: Role,
    created_from: String,
    parent: Option<ConnectionId>,
    handle: Handle,
    closed: Arc<AtomicBool>,
}

impl LiveEntry {
    fn close(&self) {
        self.shut(false);
    }

    /// Like `close`, without waiting for a call that is still running on the session.
    fn abort(&self) {
        self.shut(true);
    }

    fn shut(&self, abort: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match (&self.handle, abort) {
            (Handle::Ssh(transport), true) => transport.abort(),
            (Handle::Ssh(transport), false) => transport.close(),
            (Handle::Sftp(channel), _) => channel.close(),
        }
    }
}

/// Bounded set of live sessions to the remote host.
///
/// The registry is the only shared mutable state of the engine. Entries are appended on
/// acquire and removed by [`ConnectionId`] on release; network I/O never happens while the
/// registry lock is held. Sessions are opened through a [`Reservation`], so callers queue for
/// a free slot instead of pushing somebody else's session out.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    cap: usize,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

struct Registry {
    live: BTreeMap<ConnectionId, LiveEntry>,
    /// Free session slots. `close_all` swaps in a fresh one.
    budget: Arc<Semaphore>,
    generation: u64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, cap: usize) -> Arc<Self> {
        let cap = cap.max(1);

        Arc::new(Self {
            connector,
            cap,
            next_id: AtomicU64::new(1),
            registry: Mutex::new(Registry {
                live: BTreeMap::new(),
                budget: Arc::new(Semaphore::new(cap)),
                generation: 0,
            }),
        })
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of live sessions, which is what the cap bounds.
    pub fn live_sessions(&self) -> usize {
        self.registry()
            .live
            .values()
            .filter(|entry| entry.role == Role::Ssh)
            .count()
    }

    /// Number of registered handles, sessions and their channels alike.
    pub fn live_connections(&self) -> usize {
        self.registry().live.len()
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.registry().live.contains_key(&id)
    }

    /// Wait until `sessions` slots are free (at most the cap) and take them all at once.
    ///
    /// Taking a batch's slots together keeps two batches from each holding half of what
    /// they need. Fails only when [`close_all`](Self::close_all) runs while waiting.
    pub async fn reserve(self: &Arc<Self>, sessions: usize, tag: &str) -> Result<Arc<Reservation>, ConnectError> {
        let slots = sessions.clamp(1, self.cap);
        let (budget, generation) = self.budget();

        let permit = budget
            .acquire_many_owned(slots as u32)
            .await
            .map_err(|_| ConnectError::new(tag, anyhow!("connections were closed while waiting for a free session")))?;
        debug!(tag, slots, "reserved sessions");

        Ok(self.reservation(permit, generation, slots))
    }

    /// Like [`reserve`](Self::reserve), but fails instead of waiting when the pool is full.
    pub fn try_reserve(self: &Arc<Self>, sessions: usize, tag: &str) -> Result<Arc<Reservation>, ConnectError> {
        let slots = sessions.clamp(1, self.cap);
        let (budget, generation) = self.budget();

        let permit = budget
            .try_acquire_many_owned(slots as u32)
            .map_err(|_| ConnectError::new(tag, anyhow!("all {} sessions are in use", self.cap)))?;

        Ok(self.reservation(permit, generation, slots))
    }

    /// Open a session on a free slot right away.
    pub fn acquire_shell(self: &Arc<Self>, tag: &str) -> Result<ShellConnection, ConnectError> {
        self.try_reserve(1, tag)?.acquire_shell(tag)
    }

    /// Open a session and an SFTP channel on it right away.
    pub fn acquire_both(self: &Arc<Self>, tag: &str) -> Result<ConnectionPair, ConnectError> {
        self.try_reserve(1, tag)?.acquire_both(tag)
    }

    /// Close every live connection. Guards still held by callers become inert, reservations
    /// taken before the call can no longer open sessions, and the pool itself stays usable.
    pub fn close_all(&self) -> usize {
        let drained = {
            let mut registry = self.registry();
            registry.generation += 1;
            registry.budget.close();
            registry.budget = Arc::new(Semaphore::new(self.cap));

            std::mem::take(&mut registry.live)
        };
        let count = drained.len();

        let (channels, sessions): (Vec<_>, Vec<_>) = drained
            .into_values()
            .partition(|entry| entry.role == Role::Sftp);
        // Sockets first, so nothing below waits on a call stuck on the wire.
        sessions.iter().for_each(LiveEntry::abort);
        channels.iter().for_each(LiveEntry::close);

        if count > 0 {
            info!(count, "closed all connections");
        }

        count
    }

    fn budget(&self) -> (Arc<Semaphore>, u64) {
        let registry = self.registry();
        (registry.budget.clone(), registry.generation)
    }

    fn reservation(self: &Arc<Self>, permit: OwnedSemaphorePermit, generation: u64, slots: usize) -> Arc<Reservation> {
        Arc::new(Reservation {
            pool: self.clone(),
            generation,
            slots,
            opened: AtomicUsize::new(0),
            _permit: permit,
        })
    }

    fn open_shell(
        self: &Arc<Self>,
        tag: &str,
        reservation: &Arc<Reservation>,
    ) -> Result<ShellConnection, ConnectError> {
        let transport: Arc<dyn Transport> = Arc::from(self.connector.connect(tag)?);
        let id = self.next_id();
        let closed = Arc::new(AtomicBool::new(false));

        let registered = {
            let mut registry = self.registry();
            let current = registry.generation == reservation.generation;
            if current {
                registry.live.insert(
                    id,
                    LiveEntry {
                        role: Role::Ssh,
                        created_from: tag.to_string(),
                        parent: None,
                        handle: Handle::Ssh(transport.clone()),
                        closed: closed.clone(),
                    },
                );
            }
            current
        };

        if !registered {
            transport.close();
            return Err(ConnectError::new(
                tag,
                anyhow!("connections were closed while this session was opening"),
            ));
        }

        debug!(conn = %id, tag, "opened ssh session");

        Ok(ShellConnection {
            transport,
            lease: Lease {
                id,
                closed,
                pool: self.clone(),
                _reservation: Some(reservation.clone()),
            },
        })
    }

    fn open_files(self: &Arc<Self>, shell: ShellConnection, tag: &str) -> Result<ConnectionPair, ConnectError> {
        let channel: Arc<dyn FileChannel> = match shell.transport.open_files() {
            Ok(channel) => Arc::from(channel),
            Err(err) => return Err(ConnectError::new(tag, err)),
        };

        let id = self.next_id();
        let closed = Arc::new(AtomicBool::new(false));
        let registered = {
            let mut registry = self.registry();
            if registry.live.contains_key(&shell.id()) {
                registry.live.insert(
                    id,
                    LiveEntry {
                        role: Role::Sftp,
                        created_from: tag.to_string(),
                        parent: Some(shell.id()),
                        handle: Handle::Sftp(channel.clone()),
                        closed: closed.clone(),
                    },
                );
                true
            } else {
                false
            }
        };

        if !registered {
            channel.close();
            return Err(ConnectError::new(
                tag,
                anyhow!("session {} was closed while opening its sftp channel", shell.id()),
            ));
        }

        debug!(conn = %id, parent = %shell.id(), tag, "opened sftp channel");

        Ok(ConnectionPair {
            files: FileConnection {
                channel,
                lease: Lease {
                    id,
                    closed,
                    pool: self.clone(),
                    _reservation: None,
                },
            },
            shell,
        })
    }

    /// Remove exactly the entry registered under `id`. Unknown ids are ignored, so a
    /// connection is never closed twice.
    fn release(&self, id: ConnectionId) {
        let removed = Self::remove_with_children(&mut self.registry().live, id);

        for (released_id, entry) in removed {
            debug!(conn = %released_id, created_from = %entry.created_from, "released connection");
            entry.close();
        }
    }

    /// Removes `id` and, for a session, every channel riding on it. Channels come first.
    fn remove_with_children(
        live: &mut BTreeMap<ConnectionId, LiveEntry>,
        id: ConnectionId,
    ) -> Vec<(ConnectionId, LiveEntry)> {
        let Some(entry) = live.remove(&id) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        if entry.role == Role::Ssh {
            let children: Vec<_> = live
                .iter()
                .filter(|(_, child)| child.parent == Some(id))
                .map(|(child_id, _)| *child_id)
                .collect();

            for child_id in children {
                if let Some(child) = live.remove(&child_id) {
                    removed.push((child_id, child));
                }
            }
        }
        removed.push((id, entry));

        removed
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Session slots held by one caller. Each slot opens one session; the slots go back to the
/// pool once the reservation and every session opened through it are dropped.
pub struct Reservation {
    pool: Arc<ConnectionPool>,
    generation: u64,
    slots: usize,
    opened: AtomicUsize,
    _permit: OwnedSemaphorePermit,
}

impl Reservation {
    pub fn acquire_shell(self: &Arc<Self>, tag: &str) -> Result<ShellConnection, ConnectError> {
        if self.opened.fetch_add(1, Ordering::SeqCst) >= self.slots {
            return Err(ConnectError::new(
                tag,
                anyhow!("all {} reserved session(s) were already opened", self.slots),
            ));
        }

        self.pool.open_shell(tag, self)
    }

    /// A session together with an SFTP channel on it. The two are released independently,
    /// but releasing the session also closes the channel.
    pub fn acquire_both(self: &Arc<Self>, tag: &str) -> Result<ConnectionPair, ConnectError> {
        let shell = self.acquire_shell(tag)?;
        self.pool.open_files(shell, tag)
    }
}

/// Registration of one handle. Dropping it releases the handle from the pool.
struct Lease {
    id: ConnectionId,
    closed: Arc<AtomicBool>,
    pool: Arc<ConnectionPool>,
    _reservation: Option<Arc<Reservation>>,
}

impl Lease {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

pub struct ShellConnection {
    transport: Arc<dyn Transport>,
    lease: Lease,
}

impl ShellConnection {
    pub fn id(&self) -> ConnectionId {
        self.lease.id
    }

    pub fn is_closed(&self) -> bool {
        self.lease.closed.load(Ordering::SeqCst)
    }

    pub fn exec(&self, line: &str) -> Result<ExecOutput, TransportError> {
        self.lease.ensure_open()?;
        self.transport.exec(line)
    }

    pub fn release(self) {}
}

pub struct FileConnection {
    channel: Arc<dyn FileChannel>,
    lease: Lease,
}

impl FileConnection {
    pub fn id(&self) -> ConnectionId {
        self.lease.id
    }

    pub fn is_closed(&self) -> bool {
        self.lease.closed.load(Ordering::SeqCst)
    }

    pub fn put(&self, local: &Path, remote: &RemotePath) -> Result<(), TransportError> {
        self.lease.ensure_open()?;
        self.channel.put(local, remote)
    }

    pub fn get(&self, remote: &RemotePath, local: &Path) -> Result<(), TransportError> {
        self.lease.ensure_open()?;
        self.channel.get(remote, local)
    }

    pub fn open_read(
        &self,
        remote: &RemotePath,
    ) -> Result<Option<Box<dyn Read>>, TransportError> {
        self.lease.ensure_open()?;
        self.channel.open_read(remote)
    }

    pub fn release(self) {}
}

/// A session plus its SFTP channel, as used by one scheduler chunk.
pub struct ConnectionPair {
    // Field order matters: the channel is released before its session.
    files: FileConnection,
    shell: ShellConnection,
}

impl ConnectionPair {
    pub fn shell(&self) -> &ShellConnection {
        &self.shell
    }

    pub fn files(&self) -> &FileConnection {
        &self.files
    }

    pub fn is_closed(&self) -> bool {
        self.shell.is_closed() || self.files.is_closed()
    }

    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::remote::testing::LocalConnector;

    fn pool(cap: usize) -> (Arc<ConnectionPool>, LocalConnector) {
        let connector = LocalConnector::new();
        (ConnectionPool::new(Arc::new(connector.clone()), cap), connector)
    }

    #[test]
    fn never_exceeds_cap() {
        let (pool, connector) = pool(3);
        let mut held = Vec::new();

        for i in 0..10 {
            if let Ok(shell) = pool.acquire_shell(&format!("test-{i}")) {
                held.push(shell);
            }
            assert!(pool.live_sessions() <= 3);
        }

        assert_eq!(held.len(), 3);
        assert_eq!(connector.connects(), 3);
        assert!(held.iter().all(|conn| !conn.is_closed()));

        held.pop();
        assert!(pool.acquire_shell("freed").is_ok());
    }

    #[tokio::test]
    async fn reservations_wait_for_a_free_slot() {
        let (pool, _) = pool(2);
        let batch = pool.reserve(2, "batch").await.unwrap();
        let first = batch.acquire_both("chunk 0").unwrap();
        let second = batch.acquire_both("chunk 1").unwrap();
        assert!(batch.acquire_shell("chunk 2").is_err());

        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.reserve(1, "next batch").await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        // Slots come back once the reservation and everything opened through it is gone.
        drop(first);
        drop(batch);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(second);
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_all_wakes_waiters_and_voids_old_reservations() {
        let (pool, connector) = pool(1);
        let held = pool.acquire_shell("held").unwrap();
        assert!(pool.try_reserve(1, "full").is_err());

        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.reserve(1, "waiting").await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.close_all(), 1);
        assert!(waiting.await.unwrap().is_err());
        assert!(held.is_closed());

        let fresh = pool.reserve(1, "fresh").await.unwrap();
        pool.close_all();
        assert!(fresh.acquire_shell("too late").is_err());
        assert_eq!(pool.live_sessions(), 0);

        drop(held);
        assert!(pool.acquire_shell("after").is_ok());
        assert_eq!(connector.aborts(), 1);
    }

    #[test]
    fn closed_connection_refuses_work() {
        let (pool, _) = pool(1);
        let shell = pool.acquire_shell("first").unwrap();
        pool.close_all();

        assert!(matches!(shell.exec("true"), Err(TransportError::Closed)));
    }

    #[test]
    fn release_removes_only_that_connection() {
        let (pool, _) = pool(5);
        let a = pool.acquire_shell("same").unwrap();
        let b = pool.acquire_shell("same").unwrap();
        let b_id = b.id();

        a.release();

        assert_eq!(pool.live_sessions(), 1);
        assert!(pool.is_live(b_id));
        assert!(!b.is_closed());
    }

    #[test]
    fn pair_is_tracked_as_two_handles() {
        let (pool, connector) = pool(5);
        let pair = pool.acquire_both("pair").unwrap();

        assert_eq!(pool.live_sessions(), 1);
        assert_eq!(pool.live_connections(), 2);
        assert!(pool.is_live(pair.files().id()));

        pair.release();
        assert_eq!(pool.live_connections(), 0);
        assert_eq!(connector.closes(), 1);
        assert_eq!(connector.channel_closes(), 1);
        assert_eq!(connector.aborts(), 0);
    }

    #[test]
    fn close_all_then_acquire_again() {
        let (pool, connector) = pool(4);
        let pair = pool.acquire_both("a").unwrap();
        let shell = pool.acquire_shell("b").unwrap();

        assert_eq!(pool.close_all(), 3);
        assert!(pair.is_closed());
        assert!(shell.is_closed());
        assert_eq!(pool.live_connections(), 0);
        assert_eq!(connector.aborts(), 2);

        // Guards dropped after close_all must not close anything twice.
        drop(pair);
        drop(shell);
        assert_eq!(connector.closes(), 2);
        assert_eq!(connector.channel_closes(), 1);

        let fresh = pool.acquire_shell("after").unwrap();
        assert!(!fresh.is_closed());
        assert_eq!(pool.live_sessions(), 1);
    }

    #[test]
    fn connect_failure_is_reported_and_not_registered() {
        let (pool, connector) = pool(2);
        connector.fail_connects(true);

        let err = pool.acquire_both("doomed").err().unwrap();
        assert_eq!(err.tag, "doomed");
        assert_eq!(pool.live_connections(), 0);

        connector.fail_connects(false);
        assert!(pool.acquire_both("retry").is_ok());
        assert!(pool.acquire_both("retry again").is_ok());
    }

    #[test]
    fn concurrent_releases_do_not_lose_updates() {
        let (pool, _) = pool(64);
        let handles: Vec<_> = (0..32)
            .map(|i| pool.acquire_both(&format!("c{i}")).unwrap())
            .collect();

        std::thread::scope(|scope| {
            for pair in handles {
                scope.spawn(move || pair.release());
            }
        });

        assert_eq!(pool.live_connections(), 0);
    }
}
