use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ssh2::{ErrorCode, Sftp};
use tracing::debug;

use crate::{
    remote::{error::TransportError, transport::FileChannel},
    sync::path::RemotePath,
};

// LIBSSH2_FX_NO_SUCH_FILE
const NO_SUCH_FILE: i32 = 2;

pub struct SftpChannel {
    sftp: Mutex<Sftp>,
}

impl SftpChannel {
    pub fn new(sftp: Sftp) -> Self {
        Self {
            sftp: Mutex::new(sftp),
        }
    }

    fn sftp(&self) -> MutexGuard<'_, Sftp> {
        self.sftp.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileChannel for SftpChannel {
    fn put(&self, local: &Path, remote: &RemotePath) -> Result<(), TransportError> {
        let mut source = File::open(local)?;
        let mut dest = self.sftp().create(Path::new(remote.as_str()))?;
        io::copy(&mut source, &mut dest)?;

        Ok(())
    }

    fn get(&self, remote: &RemotePath, local: &Path) -> Result<(), TransportError> {
        let mut source = self.sftp().open(Path::new(remote.as_str()))?;
        let mut dest = File::create(local)?;
        io::copy(&mut source, &mut dest)?;

        Ok(())
    }

    fn open_read(&self, remote: &RemotePath) -> Result<Option<Box<dyn Read>>, TransportError> {
        match self.sftp().open(Path::new(remote.as_str())) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if matches!(err.code(), ErrorCode::SFTP(NO_SUCH_FILE)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn close(&self) {
        // Busy means another thread is inside an sftp call; the session disconnect ends it.
        if let Ok(mut sftp) = self.sftp.try_lock() {
            if let Err(err) = sftp.shutdown() {
                debug!("sftp shutdown failed: {err}");
            }
        }
    }
}
