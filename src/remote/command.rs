use std::{borrow::Cow, sync::OnceLock};

use regex::Regex;
use shell_escape::unix::escape;
use tracing::debug;

use super::{error::CommandError, pool::ShellConnection, transport::ExecOutput};
use crate::sync::path::RemotePath;

/// stderr lines the remote shell emits during idempotent operations that are not failures.
pub const NOISE_PATTERN: &str = r"^(chmod|bash|chgrp|cannot|Too late|: No such)|No such file or directory";

/// Everything the engine asks the remote shell to do. Paths are quoted here and nowhere else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteCommand {
    Hostname,
    MakeDir(RemotePath),
    RemoveFile(RemotePath),
    RemoveDir(RemotePath),
    FixPermissions {
        group: String,
        mode: String,
        paths: Vec<RemotePath>,
    },
    ListFiles(RemotePath),
    Digest(RemotePath),
    RestartHypnotoad(RemotePath),
    TruncateFiles(Vec<RemotePath>),
    Raw(String),
}

fn quote(path: &RemotePath) -> Cow<'_, str> {
    escape(path.as_str().into())
}

fn quote_all(paths: &[RemotePath]) -> String {
    paths.iter().map(quote).collect::<Vec<_>>().join(" ")
}

impl RemoteCommand {
    pub fn to_line(&self) -> String {
        match self {
            RemoteCommand::Hostname => "hostname".to_string(),
            RemoteCommand::MakeDir(path) => format!("mkdir -p {}", quote(path)),
            RemoteCommand::RemoveFile(path) => format!("rm -f {}", quote(path)),
            RemoteCommand::RemoveDir(path) => format!("rm -rf {}", quote(path)),
            RemoteCommand::FixPermissions { group, mode, paths } => {
                let paths = quote_all(paths);
                format!(
                    "chgrp {} {paths}; chmod {} {paths}",
                    escape(group.as_str().into()),
                    escape(mode.as_str().into()),
                )
            }
            RemoteCommand::ListFiles(root) => format!("find {} -type f -print", quote(root)),
            RemoteCommand::Digest(path) => format!("sha256sum {}", quote(path)),
            RemoteCommand::RestartHypnotoad(path) => {
                format!("hypnotoad -s {0}; hypnotoad {0}", quote(path))
            }
            RemoteCommand::TruncateFiles(paths) => paths
                .iter()
                .map(|path| format!("cat /dev/null > {}", quote(path)))
                .collect::<Vec<_>>()
                .join("; "),
            RemoteCommand::Raw(line) => line.clone(),
        }
    }

    /// Execute on `shell` and classify the result against `noise`.
    pub fn run(&self, shell: &ShellConnection, noise: &NoiseFilter) -> Result<ExecOutput, CommandError> {
        let line = self.to_line();
        debug!(conn = %shell.id(), %line, "exec");

        let output = shell
            .exec(&line)
            .map_err(|source| CommandError::Transport {
                line: line.clone(),
                source,
            })?;

        noise.check(&line, output)
    }
}

#[derive(Clone, Debug)]
pub struct NoiseFilter {
    pattern: Regex,
}

impl NoiseFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_benign(&self, stderr_line: &str) -> bool {
        self.pattern.is_match(stderr_line.trim())
    }

    pub fn check(&self, line: &str, output: ExecOutput) -> Result<ExecOutput, CommandError> {
        let unexpected: Vec<&str> = output
            .stderr
            .lines()
            .map(str::trim)
            .filter(|stderr_line| !stderr_line.is_empty() && !self.is_benign(stderr_line))
            .collect();

        if !unexpected.is_empty() {
            return Err(CommandError::Stderr {
                line: line.to_string(),
                stderr: unexpected.join("\n"),
            });
        }

        if output.exit_code != 0 && output.stderr.trim().is_empty() {
            return Err(CommandError::ExitStatus {
                line: line.to_string(),
                exit_code: output.exit_code,
            });
        }

        Ok(output)
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        static DEFAULT: OnceLock<NoiseFilter> = OnceLock::new();

        DEFAULT
            .get_or_init(|| NoiseFilter::new(NOISE_PATTERN).expect("noise pattern is a valid regex"))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::remote::{pool::ConnectionPool, testing::LocalConnector};

    #[test]
    fn paths_are_quoted_once() {
        let path = RemotePath::new("/srv/www/my app/it's.js");

        assert_eq!(
            RemoteCommand::RemoveFile(path).to_line(),
            r#"rm -f '/srv/www/my app/it'\''s.js'"#
        );
        assert_eq!(
            RemoteCommand::MakeDir(RemotePath::new("/srv/plain")).to_line(),
            "mkdir -p /srv/plain"
        );
    }

    #[test]
    fn permissions_are_batched_into_one_line() {
        let command = RemoteCommand::FixPermissions {
            group: "devs".into(),
            mode: "770".into(),
            paths: vec![RemotePath::new("/a/1.js"), RemotePath::new("/a/2.js")],
        };

        assert_eq!(
            command.to_line(),
            "chgrp devs /a/1.js /a/2.js; chmod 770 /a/1.js /a/2.js"
        );
    }

    #[test]
    fn truncate_and_hypnotoad_lines() {
        assert_eq!(
            RemoteCommand::TruncateFiles(vec![RemotePath::new("/l/a.log"), RemotePath::new("/l/b.log")])
                .to_line(),
            "cat /dev/null > /l/a.log; cat /dev/null > /l/b.log"
        );
        assert_eq!(
            RemoteCommand::RestartHypnotoad(RemotePath::new("/www/api/script/api")).to_line(),
            "hypnotoad -s /www/api/script/api; hypnotoad /www/api/script/api"
        );
    }

    #[test]
    fn noise_filter_classification() {
        let noise = NoiseFilter::default();

        assert!(noise.is_benign("chgrp: changing group of '/a': Operation not permitted"));
        assert!(noise.is_benign("find: '/missing': No such file or directory"));
        assert!(noise.is_benign("  Too late for -T option"));
        assert!(!noise.is_benign("mkdir: cannot create directory '/x': Permission denied"));
        assert!(!noise.is_benign("sha256sum: read error"));
    }

    #[test]
    fn check_surfaces_unexpected_stderr_and_silent_failures() {
        let noise = NoiseFilter::default();

        let failed = noise.check(
            "x",
            ExecOutput {
                stderr: "disk full\n".into(),
                exit_code: 1,
                ..Default::default()
            },
        );
        assert!(matches!(failed, Err(CommandError::Stderr { .. })));

        let silent = noise.check(
            "x",
            ExecOutput {
                exit_code: 3,
                ..Default::default()
            },
        );
        assert!(matches!(silent, Err(CommandError::ExitStatus { exit_code: 3, .. })));

        let benign = noise.check(
            "x",
            ExecOutput {
                stderr: "rm: '/gone': No such file or directory\n".into(),
                exit_code: 1,
                ..Default::default()
            },
        );
        assert!(benign.is_ok());
    }

    #[test]
    fn idempotent_commands_against_a_real_shell() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(Arc::new(LocalConnector::new()), 2);
        let shell = pool.acquire_shell("test").unwrap();
        let noise = NoiseFilter::default();
        let target = RemotePath::new(dir.path().join("a/b c").to_string_lossy());

        RemoteCommand::MakeDir(target.clone()).run(&shell, &noise).unwrap();
        RemoteCommand::MakeDir(target.clone()).run(&shell, &noise).unwrap();
        assert!(dir.path().join("a/b c").is_dir());

        RemoteCommand::RemoveDir(target.clone()).run(&shell, &noise).unwrap();
        RemoteCommand::RemoveDir(target.clone()).run(&shell, &noise).unwrap();
        RemoteCommand::RemoveFile(target.join("nothing")).run(&shell, &noise).unwrap();
        assert!(!dir.path().join("a/b c").exists());

        let listing = RemoteCommand::ListFiles(target).run(&shell, &noise).unwrap();
        assert!(listing.stdout.is_empty());
    }
}
