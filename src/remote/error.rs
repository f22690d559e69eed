use std::{io, path::PathBuf};

use thiserror::Error;

use crate::sync::path::RemotePath;

/// Raw failure of the underlying session or channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Ssh(#[from] ssh2::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("connection is closed")]
    Closed,
}

impl TransportError {
    /// Whether the error means "the remote file or directory does not exist".
    pub fn is_not_found(&self) -> bool {
        match self {
            // LIBSSH2_FX_NO_SUCH_FILE
            TransportError::Ssh(err) => matches!(err.code(), ssh2::ErrorCode::SFTP(2)),
            TransportError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            TransportError::Closed => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("could not connect ({tag}): {source}")]
pub struct ConnectError {
    pub tag: String,
    #[source]
    pub source: anyhow::Error,
}

impl ConnectError {
    pub fn new(tag: &str, source: impl Into<anyhow::Error>) -> Self {
        Self {
            tag: tag.to_string(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("could not read {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not read remote {path}: {source}")]
    Remote {
        path: RemotePath,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Error)]
#[error("{direction} {local} <-> {remote} failed: {source}")]
pub struct TransferError {
    pub direction: &'static str,
    pub local: PathBuf,
    pub remote: RemotePath,
    #[source]
    pub source: TransportError,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{line}` could not be executed: {source}")]
    Transport {
        line: String,
        #[source]
        source: TransportError,
    },

    #[error("`{line}` failed: {stderr}")]
    Stderr { line: String, stderr: String },

    #[error("`{line}` exited with status {exit_code}")]
    ExitStatus { line: String, exit_code: i32 },
}
