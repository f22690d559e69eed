use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    task::{spawn_blocking, JoinSet},
};
use tracing::error;

use super::watch::SyncQueues;
use crate::{
    config::ConfigContext,
    progress::{ProgressView, ESEQ_RED, ESEQ_RESET, ESEQ_WEAK},
    remote::{command::RemoteCommand, transfer::RemoteMutator},
    sync::{schedule::ChunkScheduler, task::Outcome},
    util::indent_str,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    KillAll,
    Sync(String),
    Hypnotoad(String),
    Apache,
    Logs,
    Pull,
    Exec(String),
    Quit,
    Empty,
    Unknown(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match (word, rest) {
            ("", _) => ConsoleCommand::Empty,
            ("help" | "?", "") => ConsoleCommand::Help,
            ("killall", "") => ConsoleCommand::KillAll,
            ("apache", "") => ConsoleCommand::Apache,
            ("logs", "") => ConsoleCommand::Logs,
            ("pull", "") => ConsoleCommand::Pull,
            ("quit" | "exit", "") => ConsoleCommand::Quit,
            ("hyp", name) if !name.is_empty() && !name.contains(char::is_whitespace) => {
                ConsoleCommand::Hypnotoad(name.to_string())
            }
            ("cmd", command) if !command.is_empty() => ConsoleCommand::Exec(command.to_string()),
            (repo, "") if !matches!(repo, "hyp" | "cmd") => ConsoleCommand::Sync(repo.to_string()),
            _ => ConsoleCommand::Unknown(line.to_string()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Print(String),
    Quit,
}

#[derive(Clone)]
pub struct Console {
    ctx: Arc<ConfigContext>,
    scheduler: Arc<ChunkScheduler>,
    mutator: Arc<RemoteMutator>,
    queues: SyncQueues,
}

impl Console {
    pub fn new(
        ctx: Arc<ConfigContext>,
        scheduler: Arc<ChunkScheduler>,
        mutator: Arc<RemoteMutator>,
        queues: SyncQueues,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            mutator,
            queues,
        }
    }

    pub async fn run(&self) -> Result<()> {
        self.run_with(BufReader::new(tokio::io::stdin())).await
    }

    /// Read commands until `quit` or end of input. Failed commands are printed.
    ///
    /// Every command runs as its own task, so input is read while a sync is still going.
    /// `quit` aborts whatever is running; end of input waits for it.
    pub async fn run_with<R: AsyncBufRead + Unpin>(&self, input: R) -> Result<()> {
        let mut lines = input.lines();
        let mut running = JoinSet::new();
        println!("{}", self.help());

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Could not read commands")? else {
                        break;
                    };

                    match ConsoleCommand::parse(&line) {
                        ConsoleCommand::Quit => {
                            running.shutdown().await;
                            return Ok(());
                        }
                        ConsoleCommand::Empty => {}
                        command => {
                            let console = self.clone();
                            running.spawn(async move { console.report(command).await });
                        }
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(err) = joined {
                        error!("console command crashed: {err}");
                    }
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                error!("console command crashed: {err}");
            }
        }

        Ok(())
    }

    async fn report(&self, command: ConsoleCommand) {
        match self.execute(command).await {
            Ok(Reply::Print(text)) if text.is_empty() => {}
            Ok(Reply::Print(text)) => println!("{text}"),
            Ok(Reply::Quit) => {}
            Err(err) => println!("{ESEQ_RED}! {err:#}{ESEQ_RESET}"),
        }
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Result<Reply> {
        let text = match command {
            ConsoleCommand::Quit => return Ok(Reply::Quit),
            ConsoleCommand::Empty => String::new(),
            ConsoleCommand::Help => self.help(),
            ConsoleCommand::Unknown(line) => format!("Unknown command `{line}`, type `help`"),
            ConsoleCommand::KillAll => {
                let pool = self.scheduler.pool().clone();
                let closed = spawn_blocking(move || pool.close_all()).await?;
                format!("Closed {closed} connection(s)")
            }
            ConsoleCommand::Sync(repo) => {
                if !self.ctx.repo_names().any(|name| name == repo) {
                    return Ok(Reply::Print(format!("Unknown command `{repo}`, type `help`")));
                }

                let results = self.queues.full_sync(&repo).await?;
                let failed = results.iter().filter(|result| result.outcome.is_failed()).count();
                let cancelled = results
                    .iter()
                    .filter(|result| result.outcome == Outcome::Cancelled)
                    .count();

                format!(
                    "Full sync of `{repo}`: {} object(s), {failed} failed, {cancelled} cancelled",
                    results.len()
                )
            }
            ConsoleCommand::Hypnotoad(name) => {
                let script = self
                    .ctx
                    .config
                    .hypnotoad
                    .get(&name)
                    .ok_or_else(|| anyhow!("No hypnotoad app named `{name}`"))?;
                let command = RemoteCommand::RestartHypnotoad(self.ctx.remote(script));

                self.remote_exec(&format!("Restarting {name}"), command).await?
            }
            ConsoleCommand::Apache => {
                let line = self
                    .ctx
                    .config
                    .apache_restart
                    .clone()
                    .ok_or_else(|| anyhow!("No apache restart command configured"))?;

                self.remote_exec("Restarting apache", RemoteCommand::Raw(line)).await?
            }
            ConsoleCommand::Logs => {
                let logs = &self.ctx.config.logs;
                if logs.is_empty() {
                    return Err(anyhow!("No log files configured"));
                }
                let paths = logs.iter().map(|log| self.ctx.remote(log)).collect();

                self.remote_exec("Truncating logs", RemoteCommand::TruncateFiles(paths)).await?
            }
            ConsoleCommand::Pull => self.pull().await?,
            ConsoleCommand::Exec(line) => self.remote_exec(&line.clone(), RemoteCommand::Raw(line)).await?,
        };

        Ok(Reply::Print(text))
    }

    fn help(&self) -> String {
        let repos = self.ctx.repo_names().collect::<Vec<_>>().join(", ");

        [
            "Commands:".to_string(),
            format!("  <repo>      full sync of one repository ({repos})"),
            "  hyp <name>  restart a hypnotoad app".to_string(),
            "  apache      restart apache".to_string(),
            "  logs        truncate the remote log files".to_string(),
            "  pull        download the mirrored log files".to_string(),
            "  cmd <line>  run a command on the remote host".to_string(),
            "  killall     close every remote connection".to_string(),
            "  quit        exit".to_string(),
        ]
        .join("\n")
    }

    async fn remote_exec(&self, label: &str, command: RemoteCommand) -> Result<String> {
        let tag = format!("console: {label}");
        let reservation = self.scheduler.pool().reserve(1, &tag).await?;
        let noise = self.mutator.noise().clone();
        let label = label.to_string();

        let output = spawn_blocking(move || {
            ProgressView::with(&label, |mut view| {
                let result = reservation
                    .acquire_shell(&tag)
                    .map_err(anyhow::Error::from)
                    .and_then(|shell| Ok(command.run(&shell, &noise)?));

                match &result {
                    Ok(_) => view.success(None),
                    Err(err) => view.failure(Some(&err.to_string())),
                }
                result
            })
        })
        .await??;

        let mut text = indent_str(output.stdout.trim_end(), 2);
        if !output.stderr.trim().is_empty() {
            text.push_str(&format!(
                "\n{ESEQ_WEAK}{}{ESEQ_RESET}",
                indent_str(output.stderr.trim_end(), 2)
            ));
        }

        Ok(text)
    }

    async fn pull(&self) -> Result<String> {
        let mirrors: Vec<_> = self
            .ctx
            .config
            .log_mirrors
            .iter()
            .map(|mirror| (self.ctx.remote(&mirror.remote), mirror.local.clone()))
            .collect();
        if mirrors.is_empty() {
            return Err(anyhow!("No log mirrors configured"));
        }

        let reservation = self.scheduler.pool().reserve(1, "console: pull").await?;
        let mutator = self.mutator.clone();

        spawn_blocking(move || -> Result<String> {
            let conn = reservation.acquire_both("console: pull")?;
            let lines: Vec<String> = mirrors
                .iter()
                .map(|(remote, local)| match mutator.download(remote, local, conn.files()) {
                    Ok(outcome) => format!("  {remote} -> {} ({outcome})", local.display()),
                    Err(err) => format!("  {ESEQ_RED}! {err}{ESEQ_RESET}"),
                })
                .collect();

            Ok(lines.join("\n"))
        })
        .await?
    }
}
