use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    adapter::fs::{IgnoreRules, DEFAULT_IGNORE},
    remote::{integrity::CompareStrategy, transfer::Permissions},
    sync::{
        aggregate::DEFAULT_WINDOW,
        path::{PathResolver, RemotePath, RepoCategory, RepoMapping},
    },
    util::expand_home,
};

pub mod ssh;

pub const DEFAULT_CONFIG: &str = "./devsync.yaml";

pub fn read_config(path: Option<PathBuf>) -> Result<ConfigContext> {
    let path = path.unwrap_or(DEFAULT_CONFIG.into());
    let file = File::open(&path).with_context(|| format!("Could not open {}", path.display()))?;
    let reader = BufReader::new(file);

    let config: Configuration = serde_yaml::from_reader(reader)
        .with_context(|| format!("Could not parse {}", path.display()))?;

    ConfigContext::new(path, config)
}

/// Validated configuration plus everything derived from it once at startup.
#[derive(Debug)]
pub struct ConfigContext {
    pub config_file: PathBuf,
    pub config: Configuration,
    resolver: PathResolver,
}

impl ConfigContext {
    pub fn new(config_file: PathBuf, mut config: Configuration) -> Result<Self> {
        ensure!(config.pool.cap >= 1, "pool.cap must be at least 1");
        ensure!(config.pool.concurrency >= 1, "pool.concurrency must be at least 1");
        ensure!(!config.repos.is_empty(), "No repositories configured");
        ensure!(
            config.remote_base.starts_with('/'),
            "remote_base must be absolute, got {}",
            config.remote_base
        );

        let base_dir = config_file
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();

        let remote_base = RemotePath::new(&config.remote_base);
        let mut resolver = PathResolver::new();

        for (name, repo) in config.repos.iter_mut() {
            let local = base_dir.join(expand_home(&repo.local.to_string_lossy()));
            if !local.is_dir() {
                bail!("Repository `{name}`: {} is not a directory", local.display());
            }
            repo.local = local.canonicalize().unwrap_or(local);

            let mapping = RepoMapping::new(
                &remote_base,
                name,
                repo.category,
                repo.subpath.as_deref(),
                &repo.local,
            )
            .with_strip_segments(repo.strip_segments)
            .with_rename(repo.rename.clone());

            resolver = resolver.with_repo(name, mapping);
        }

        for mirror in config.log_mirrors.iter_mut() {
            mirror.local = base_dir.join(expand_home(&mirror.local.to_string_lossy()));
        }

        Ok(Self {
            config_file,
            config,
            resolver,
        })
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn repo_names(&self) -> impl Iterator<Item = &str> {
        self.config.repos.keys().map(String::as_str)
    }

    pub fn ignore_rules(&self, repo: &str) -> Result<IgnoreRules> {
        let root = &self.resolver.mapping(repo)?.local_root;

        IgnoreRules::new(root, &self.config.ignore)
            .with_context(|| format!("Invalid ignore rules for `{repo}`"))
    }

    /// Remote paths in the config are relative to `remote_base` unless absolute.
    pub fn remote(&self, path: &str) -> RemotePath {
        if path.starts_with('/') {
            RemotePath::new(path)
        } else {
            RemotePath::new(&self.config.remote_base).join(path)
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.config.debounce_ms)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Configuration {
    pub host: HostConfig,
    pub remote_base: String,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default = "Configuration::default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default)]
    pub compare: CompareStrategy,

    #[serde(default)]
    pub permissions: Option<Permissions>,

    #[serde(default = "Configuration::default_ignore")]
    pub ignore: String,

    pub repos: BTreeMap<String, RepoConfig>,

    #[serde(default)]
    pub hypnotoad: BTreeMap<String, String>,

    #[serde(default)]
    pub apache_restart: Option<String>,

    #[serde(default)]
    pub logs: Vec<String>,

    #[serde(default)]
    pub log_mirrors: Vec<LogMirror>,
}

impl Configuration {
    fn default_debounce_ms() -> u64 {
        DEFAULT_WINDOW.as_millis() as u64
    }

    fn default_ignore() -> String {
        DEFAULT_IGNORE.to_string()
    }
}

#[cfg(test)]
impl Configuration {
    /// One web app `site` at `local`, deployed under `remote`, with a pool of four sessions.
    pub fn single_site(remote: &Path, local: &Path) -> Self {
        Self {
            host: HostConfig {
                name: "devbox".into(),
                user: None,
                identity_file: None,
                timeout_secs: 30,
            },
            remote_base: remote.to_string_lossy().to_string(),
            pool: PoolConfig {
                cap: 4,
                concurrency: 2,
            },
            debounce_ms: 1000,
            compare: Default::default(),
            permissions: None,
            ignore: String::new(),
            repos: BTreeMap::from([(
                "site".to_string(),
                RepoConfig {
                    local: local.to_path_buf(),
                    category: RepoCategory::WebApp,
                    subpath: None,
                    strip_segments: 0,
                    rename: Default::default(),
                },
            )]),
            hypnotoad: BTreeMap::new(),
            apache_restart: Some("echo restarted".into()),
            logs: vec!["logs/error_log".into()],
            log_mirrors: vec![LogMirror {
                remote: "logs/error_log".into(),
                local: local.join("mirror/error.log"),
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,

    #[serde(default = "HostConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HostConfig {
    fn default_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub cap: usize,
    pub concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cap: 8,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub local: PathBuf,
    pub category: RepoCategory,
    pub subpath: Option<String>,

    #[serde(default)]
    pub strip_segments: usize,

    #[serde(default)]
    pub rename: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogMirror {
    pub remote: String,
    pub local: PathBuf,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const SAMPLE: &str = r#"
host:
  name: devbox
  user: alice
remote_base: /home/alice/dev
pool:
  cap: 4
  concurrency: 2
compare: digest
permissions:
  group: devs
repos:
  ud:
    local: ../work/ud
    category: web_app
    subpath: UD
    rename: { ud_api: UD_api }
  wam_cron:
    local: ../work/wam_cron
    category: cron
hypnotoad: { udapi: www/UD/UD_api/script/ud_api }
logs: [logs/error_log]
log_mirrors:
  - { remote: logs/error_log, local: logs/error.log }
"#;

    fn write_sample(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("work/ud/ud_api")).unwrap();
        fs::create_dir_all(dir.path().join("work/wam_cron")).unwrap();
        fs::create_dir_all(dir.path().join("conf")).unwrap();

        let path = dir.path().join("conf/devsync.yaml");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_and_resolves_a_full_config() {
        let (dir, path) = write_sample(SAMPLE);
        let ctx = read_config(Some(path)).unwrap();
        let root = dir.path().canonicalize().unwrap();

        assert_eq!(ctx.config.pool.cap, 4);
        assert_eq!(ctx.config.compare, CompareStrategy::Digest);
        assert_eq!(ctx.config.permissions.as_ref().unwrap().mode, "770");
        assert_eq!(ctx.config.debounce_ms, 1000);
        assert_eq!(ctx.repo_names().collect::<Vec<_>>(), ["ud", "wam_cron"]);

        let remote = ctx
            .resolver()
            .remote_path("ud", &root.join("work/ud/ud_api/Api.pm"))
            .unwrap();
        assert_eq!(remote.as_str(), "/home/alice/dev/www/UD/UD_api/Api.pm");

        assert_eq!(ctx.remote("logs/error_log").as_str(), "/home/alice/dev/logs/error_log");
        assert_eq!(ctx.remote("/var/log/x").as_str(), "/var/log/x");
        assert!(ctx.config.log_mirrors[0].local.ends_with("conf/logs/error.log"));

        let rules = ctx.ignore_rules("wam_cron").unwrap();
        assert!(rules.is_ignored(&root.join("work/wam_cron/.git/HEAD"), false));
    }

    #[test]
    fn rejects_invalid_settings() {
        let (_dir, path) = write_sample(&SAMPLE.replace("cap: 4", "cap: 0"));
        let err = read_config(Some(path)).unwrap_err();
        assert!(err.to_string().contains("pool.cap"), "{err:#}");

        let (_dir, path) = write_sample(&SAMPLE.replace("category: cron", "category: daemon"));
        assert!(read_config(Some(path)).is_err());

        let (_dir, path) = write_sample(&SAMPLE.replace("../work/wam_cron", "../work/missing"));
        let err = read_config(Some(path)).unwrap_err();
        assert!(err.to_string().contains("wam_cron"), "{err:#}");
    }
}
