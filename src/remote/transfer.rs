use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    command::{NoiseFilter, RemoteCommand},
    error::{CompareError, TransferError, TransportError},
    integrity::{needs_sync, needs_sync_streamed, CompareStrategy},
    pool::{ConnectionPair, FileConnection},
};
use crate::sync::{
    path::RemotePath,
    schedule::ChunkRunner,
    task::{ChangeKind, Outcome, SyncResult, SyncTask},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub group: String,
    #[serde(default = "Permissions::default_mode")]
    pub mode: String,
}

impl Permissions {
    fn default_mode() -> String {
        "770".to_string()
    }
}

/// Turns sync tasks into remote commands and file transfers.
#[derive(Clone, Debug, Default)]
pub struct RemoteMutator {
    permissions: Option<Permissions>,
    compare: CompareStrategy,
    noise: NoiseFilter,
}

impl RemoteMutator {
    pub fn new(compare: CompareStrategy, noise: NoiseFilter) -> Self {
        Self {
            permissions: None,
            compare,
            noise,
        }
    }

    pub fn with_permissions(mut self, permissions: Option<Permissions>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn noise(&self) -> &NoiseFilter {
        &self.noise
    }

    pub fn apply(&self, task: &SyncTask, conn: &ConnectionPair) -> Outcome {
        let result = match task.kind {
            ChangeKind::Add | ChangeKind::Modify => self.upload(task, conn),
            ChangeKind::Remove => self
                .exec(RemoteCommand::RemoveFile(task.remote_path.clone()), conn)
                .map(|_| Outcome::Deleted),
            ChangeKind::AddDir => self
                .exec(RemoteCommand::MakeDir(task.remote_path.clone()), conn)
                .map(|_| Outcome::Synced),
            ChangeKind::RemoveDir => self
                .exec(RemoteCommand::RemoveDir(task.remote_path.clone()), conn)
                .map(|_| Outcome::Deleted),
        };

        result.unwrap_or_else(Outcome::Failed)
    }

    fn upload(&self, task: &SyncTask, conn: &ConnectionPair) -> Result<Outcome, String> {
        if task.is_repo_full_sync {
            let needed = needs_sync(
                &task.local_path,
                &task.remote_path,
                conn,
                self.compare,
                &self.noise,
            )
            .map_err(|err| err.to_string())?;

            if !needed {
                return Ok(Outcome::Skipped);
            }
        }

        self.exec(RemoteCommand::MakeDir(task.remote_parent_path.clone()), conn)?;

        conn.files()
            .put(&task.local_path, &task.remote_path)
            .map_err(|source| {
                TransferError {
                    direction: "upload",
                    local: task.local_path.clone(),
                    remote: task.remote_path.clone(),
                    source,
                }
                .to_string()
            })?;

        Ok(Outcome::Synced)
    }

    fn exec(&self, command: RemoteCommand, conn: &ConnectionPair) -> Result<(), String> {
        command
            .run(conn.shell(), &self.noise)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    /// One `chgrp`/`chmod` round trip covering every file uploaded by the chunk.
    pub fn fix_permissions(&self, results: &[SyncResult], conn: &ConnectionPair) {
        let Some(permissions) = &self.permissions else {
            return;
        };

        let paths: Vec<RemotePath> = results
            .iter()
            .filter(|result| result.task.kind.is_upload() && result.outcome == Outcome::Synced)
            .map(|result| result.task.remote_path.clone())
            .collect();
        if paths.is_empty() {
            return;
        }

        let count = paths.len();
        let command = RemoteCommand::FixPermissions {
            group: permissions.group.clone(),
            mode: permissions.mode.clone(),
            paths,
        };

        match command.run(conn.shell(), &self.noise) {
            Ok(_) => debug!(conn = %conn.shell().id(), count, "fixed permissions"),
            Err(err) => warn!(conn = %conn.shell().id(), "permission fixup failed: {err}"),
        }
    }

    /// Mirror `remote` into `local`, skipping the transfer when both are already equal.
    pub fn download(
        &self,
        remote: &RemotePath,
        local: &Path,
        files: &FileConnection,
    ) -> Result<Outcome, TransferError> {
        let transfer_err = |source: TransportError| TransferError {
            direction: "download",
            local: local.to_path_buf(),
            remote: remote.clone(),
            source,
        };

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|err| transfer_err(err.into()))?;
        }

        if local.exists() {
            match needs_sync_streamed(local, remote, files) {
                Ok(false) => return Ok(Outcome::Skipped),
                Ok(true) => {}
                Err(CompareError::Remote { source, .. }) => return Err(transfer_err(source)),
                Err(err) => debug!("comparison before download failed, fetching anyway: {err}"),
            }
        }

        files.get(remote, local).map_err(transfer_err)?;

        Ok(Outcome::Synced)
    }
}

impl ChunkRunner for RemoteMutator {
    fn run_task(&self, task: &SyncTask, conn: &ConnectionPair) -> Outcome {
        self.apply(task, conn)
    }

    fn finish_chunk(&self, results: &[SyncResult], conn: &ConnectionPair) {
        self.fix_permissions(results, conn);
    }
}
