use std::{io::Read, path::Path};

use super::error::{ConnectError, TransportError};
use crate::sync::path::RemotePath;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// One authenticated session on the remote host.
///
/// Every call blocks until the remote side answers, so callers run them on the blocking pool.
pub trait Transport: Send + Sync {
    fn exec(&self, line: &str) -> Result<ExecOutput, TransportError>;

    /// Open a file channel riding on this session.
    fn open_files(&self) -> Result<Box<dyn FileChannel>, TransportError>;

    fn close(&self);

    /// Tear the session down without waiting for calls still running on it.
    fn abort(&self) {
        self.close()
    }
}

/// Directory-like byte channel (SFTP).
pub trait FileChannel: Send + Sync {
    /// Upload `local` over `remote`, creating or truncating it.
    fn put(&self, local: &Path, remote: &RemotePath) -> Result<(), TransportError>;

    fn get(&self, remote: &RemotePath, local: &Path) -> Result<(), TransportError>;

    /// `Ok(None)` when the remote file does not exist.
    fn open_read(&self, remote: &RemotePath) -> Result<Option<Box<dyn Read>>, TransportError>;

    fn close(&self);
}

pub trait Connector: Send + Sync {
    /// `tag` names the caller, for diagnostics only.
    fn connect(&self, tag: &str) -> Result<Box<dyn Transport>, ConnectError>;
}
