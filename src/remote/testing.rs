//! In-process transport used by the engine tests: "remote" paths are plain local paths
//! (usually inside a temp dir) and commands run through the local `sh`.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    process::Command,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use super::{
    error::{ConnectError, TransportError},
    transport::{Connector, ExecOutput, FileChannel, Transport},
};
use crate::sync::path::RemotePath;

#[derive(Default)]
struct LocalState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    aborts: AtomicUsize,
    channel_closes: AtomicUsize,
    fail_connects: AtomicBool,
    stall_puts: AtomicBool,
    put_delay_ms: AtomicU64,
    puts_started: AtomicUsize,
    lines: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct LocalConnector {
    state: Arc<LocalState>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Sessions torn down by `close_all` rather than released.
    pub fn aborts(&self) -> usize {
        self.state.aborts.load(Ordering::SeqCst)
    }

    pub fn channel_closes(&self) -> usize {
        self.state.channel_closes.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Make every `put` hang until its session is closed.
    pub fn stall_puts(&self, stall: bool) {
        self.state.stall_puts.store(stall, Ordering::SeqCst);
    }

    /// Make every `put` take at least `delay`.
    pub fn delay_puts(&self, delay: Duration) {
        self.state.put_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn puts_started(&self) -> usize {
        self.state.puts_started.load(Ordering::SeqCst)
    }

    /// Every command line executed so far, in order.
    pub fn lines(&self) -> Vec<String> {
        self.state.lines.lock().unwrap().clone()
    }
}

impl Connector for LocalConnector {
    fn connect(&self, tag: &str) -> Result<Box<dyn Transport>, ConnectError> {
        if self.state.fail_connects.load(Ordering::SeqCst) {
            return Err(ConnectError::new(
                tag,
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            ));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalTransport {
            state: self.state.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct LocalTransport {
    state: Arc<LocalState>,
    closed: Arc<AtomicBool>,
}

impl Transport for LocalTransport {
    fn exec(&self, line: &str) -> Result<ExecOutput, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.state.lines.lock().unwrap().push(line.to_string());
        let output = Command::new("sh").arg("-c").arg(line).output()?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn open_files(&self) -> Result<Box<dyn FileChannel>, TransportError> {
        Ok(Box::new(LocalFiles {
            state: self.state.clone(),
            session_closed: self.closed.clone(),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        self.close();
    }
}

struct LocalFiles {
    state: Arc<LocalState>,
    session_closed: Arc<AtomicBool>,
}

impl FileChannel for LocalFiles {
    fn put(&self, local: &Path, remote: &RemotePath) -> Result<(), TransportError> {
        self.state.puts_started.fetch_add(1, Ordering::SeqCst);
        if self.state.stall_puts.load(Ordering::SeqCst) {
            while !self.session_closed.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(TransportError::Closed);
        }

        let delay = self.state.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        std::fs::copy(local, remote.as_str())?;
        Ok(())
    }

    fn get(&self, remote: &RemotePath, local: &Path) -> Result<(), TransportError> {
        std::fs::copy(remote.as_str(), local)?;
        Ok(())
    }

    fn open_read(&self, remote: &RemotePath) -> Result<Option<Box<dyn Read>>, TransportError> {
        match File::open(remote.as_str()) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn close(&self) {
        self.state.channel_closes.fetch_add(1, Ordering::SeqCst);
    }
}
