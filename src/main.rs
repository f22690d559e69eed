mod adapter;
mod config;
mod progress;
mod remote;
mod services;
mod sync;
mod util;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::Parser;
use tokio::{sync::mpsc::unbounded_channel, task::spawn_blocking};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    adapter::ssh::SSHConnector,
    config::{read_config, ssh::SSHConfig, DEFAULT_CONFIG},
    progress::spawn_console,
    remote::{
        command::{NoiseFilter, RemoteCommand},
        pool::ConnectionPool,
        transfer::RemoteMutator,
    },
    services::{
        console::Console,
        watch::{full_sync, start_watching, SyncQueues},
    },
    sync::schedule::ChunkScheduler,
};

#[derive(Parser)]
#[command(name = "devsync")]
#[command(version, about = "Mirror local repositories onto a remote development host")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Run one full sync of this repository, then exit
    #[arg(long, value_name = "REPO")]
    sync: Option<String>,

    /// Do not watch the repositories, only take console commands
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let ctx = Arc::new(read_config(Some(cli.config))?);
    info!(config = %ctx.config_file.display(), repos = ctx.config.repos.len(), "loaded configuration");

    let target = SSHConfig::new(&ctx.config.host.name)?.target(&ctx.config.host)?;
    let pool = ConnectionPool::new(Arc::new(SSHConnector::new(target)), ctx.config.pool.cap);

    let (progress_tx, progress_rx) = unbounded_channel();
    let progress = spawn_console(progress_rx);
    let scheduler = Arc::new(
        ChunkScheduler::new(pool.clone(), ctx.config.pool.concurrency).with_progress(progress_tx),
    );
    let mutator = Arc::new(
        RemoteMutator::new(ctx.config.compare, NoiseFilter::default())
            .with_permissions(ctx.config.permissions.clone()),
    );

    // Bad credentials should stop us here rather than on the first change.
    let hostname = {
        let pool = pool.clone();
        spawn_blocking(move || -> Result<String> {
            let shell = pool.acquire_shell("startup")?;
            Ok(RemoteCommand::Hostname.run(&shell, &NoiseFilter::default())?.stdout)
        })
        .await??
    };
    info!(host = hostname.trim(), "remote host is reachable");

    if let Some(repo) = cli.sync {
        let result = tokio::select! {
            result = full_sync(&ctx, &repo, &scheduler, mutator) => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };

        let closed = spawn_blocking(move || pool.close_all()).await?;
        debug!(closed, "shutdown");

        drop(scheduler);
        let _ = progress.join();

        let Some(results) = result else {
            bail!("Interrupted");
        };
        let results = results?;
        let failed = results.iter().filter(|result| result.outcome.is_failed()).count();
        if failed > 0 {
            bail!("{failed} of {} task(s) failed", results.len());
        }

        return Ok(());
    }

    let queues = SyncQueues::start(ctx.clone(), scheduler.clone(), mutator.clone());
    let watchers = if cli.no_watch {
        Vec::new()
    } else {
        start_watching(&ctx, &queues)?
    };
    debug!(repos = ?watchers.iter().map(|watcher| watcher.repo()).collect::<Vec<_>>(), "watchers running");
    let console = Console::new(ctx, scheduler, mutator, queues);

    tokio::select! {
        result = console.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let closed = spawn_blocking(move || pool.close_all()).await?;
    debug!(closed, "shutdown");

    Ok(())
}
