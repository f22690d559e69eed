use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};
use sha256::try_digest;

use super::{
    command::{NoiseFilter, RemoteCommand},
    error::CompareError,
    pool::{ConnectionPair, FileConnection, ShellConnection},
};
use crate::sync::path::RemotePath;

const REMOTE_BUFFER: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareStrategy {
    /// Stream both sides and compare bytes.
    #[default]
    Stream,
    /// Hash remotely with `sha256sum` and compare with the local digest.
    Digest,
}

/// Whether `local` has to be transferred over `remote`. A missing remote file always needs it.
pub fn needs_sync(
    local: &Path,
    remote: &RemotePath,
    conn: &ConnectionPair,
    strategy: CompareStrategy,
    noise: &NoiseFilter,
) -> Result<bool, CompareError> {
    match strategy {
        CompareStrategy::Stream => needs_sync_streamed(local, remote, conn.files()),
        CompareStrategy::Digest => needs_sync_by_digest(local, remote, conn.shell(), noise),
    }
}

pub fn needs_sync_streamed(
    local: &Path,
    remote: &RemotePath,
    files: &FileConnection,
) -> Result<bool, CompareError> {
    let local_err = |source| CompareError::Local {
        path: local.to_path_buf(),
        source,
    };

    let mut local_reader = BufReader::new(File::open(local).map_err(local_err)?);
    let remote_reader = match files.open_read(remote) {
        Ok(Some(reader)) => reader,
        Ok(None) => return Ok(true),
        Err(err) if err.is_not_found() => return Ok(true),
        Err(source) => {
            return Err(CompareError::Remote {
                path: remote.clone(),
                source,
            })
        }
    };
    let mut remote_reader = BufReader::with_capacity(REMOTE_BUFFER, remote_reader);

    match streams_equal(&mut local_reader, &mut remote_reader) {
        Ok(equal) => Ok(!equal),
        Err(StreamError::Left(source)) => Err(local_err(source)),
        Err(StreamError::Right(source)) => Err(CompareError::Remote {
            path: remote.clone(),
            source: source.into(),
        }),
    }
}

pub fn needs_sync_by_digest(
    local: &Path,
    remote: &RemotePath,
    shell: &ShellConnection,
    noise: &NoiseFilter,
) -> Result<bool, CompareError> {
    let output = RemoteCommand::Digest(remote.clone()).run(shell, noise)?;

    // A missing file only produces (benign) stderr.
    let Some(remote_digest) = output.stdout.split_whitespace().next() else {
        return Ok(true);
    };

    let local_digest = try_digest(local).map_err(|source| CompareError::Local {
        path: local.to_path_buf(),
        source,
    })?;

    Ok(local_digest != remote_digest)
}

enum StreamError {
    Left(io::Error),
    Right(io::Error),
}

/// Compare two readers incrementally, stopping at the first differing byte.
fn streams_equal(left: &mut impl BufRead, right: &mut impl BufRead) -> Result<bool, StreamError> {
    loop {
        let left_chunk = left.fill_buf().map_err(StreamError::Left)?;
        let right_chunk = right.fill_buf().map_err(StreamError::Right)?;

        match (left_chunk.is_empty(), right_chunk.is_empty()) {
            (true, true) => return Ok(true),
            (true, false) | (false, true) => return Ok(false),
            (false, false) => {}
        }

        let len = left_chunk.len().min(right_chunk.len());
        if left_chunk[..len] != right_chunk[..len] {
            return Ok(false);
        }

        left.consume(len);
        right.consume(len);
    }
}
