use std::{
    fmt::Write,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use spinners_rs::{Spinner, Spinners};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use uuid::Uuid;

use crate::sync::task::{Outcome, SyncResult};

// ESEQ is for "escape sequence"
pub const ESEQ_DELETE_LINE: &str = "\x1b[0J";
pub const ESEQ_RED: &str = "\x1b[38;5;1m";
pub const ESEQ_GREEN: &str = "\x1b[38;5;2m";
pub const ESEQ_WEAK: &str = "\x1b[38;5;240m";
pub const ESEQ_RESET: &str = "\x1b[m";

pub const SPINNER_MS: u64 = 50;

/// What the scheduler tells the console about a running batch.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Started {
        batch: Uuid,
        total: usize,
    },
    TaskDone {
        batch: Uuid,
        done: usize,
        total: usize,
        result: SyncResult,
    },
    Finished {
        batch: Uuid,
        results: Vec<SyncResult>,
    },
}

pub struct ProgressView {
    task: String,
    spinner: Spinner,
    previous_update: Instant,
}

impl ProgressView {
    pub fn new(task: impl ToString) -> Self {
        let mut spinner = Spinner::new(Spinners::BouncingBar, task.to_string());
        spinner.set_interval(SPINNER_MS);

        Self {
            task: task.to_string(),
            spinner,
            previous_update: Instant::now(),
        }
    }

    pub fn with<T>(task: impl ToString, func: impl FnOnce(Self) -> T) -> T {
        let mut view = Self::new(task);
        view.start();

        func(view)
    }

    pub fn start(&mut self) {
        self.spinner.start();
    }

    pub fn report_intermediate(&mut self, progress: (usize, usize), comment: Option<&str>) {
        // The last tick always gets through so the count ends on N/N.
        if progress.0 < progress.1
            && self.previous_update.elapsed() <= Duration::from_millis(SPINNER_MS * 2)
        {
            return;
        }
        self.previous_update = Instant::now();

        self.spinner.set_message(format!(
            "{ESEQ_DELETE_LINE}[{}/{}] {}{}{ESEQ_RESET}",
            progress.0,
            progress.1,
            self.task,
            comment
                .map(|comment| format!("{ESEQ_WEAK} - {comment}"))
                .unwrap_or("".to_owned())
        ));
    }

    pub fn success(&mut self, message: Option<&str>) {
        self.finish(ESEQ_GREEN, '✓', message);
    }

    pub fn failure(&mut self, message: Option<&str>) {
        self.finish(ESEQ_RED, '!', message);
    }

    fn finish(&mut self, color: &str, mark: char, message: Option<&str>) {
        self.previous_update = Instant::now();

        self.spinner.stop_with_message(format!(
            "{ESEQ_DELETE_LINE}{color}{mark} {}{}{ESEQ_RESET}",
            self.task,
            message
                .map(|message| format!(" - {}", message))
                .unwrap_or("".to_owned())
        ));
        println!();
    }
}

/// Listing printed after every batch: each watcher-driven change, and every failure.
pub fn render_results(results: &[SyncResult]) -> String {
    let mut out = format!("{} objects processed:\n", results.len());
    let mut skipped = 0;

    for result in results {
        let path = result.task.local_path.display();
        match &result.outcome {
            Outcome::Failed(reason) => {
                let _ = writeln!(
                    out,
                    "  {ESEQ_RED}! {} -> {path}: {reason}{ESEQ_RESET}",
                    result.task.kind
                );
            }
            Outcome::Cancelled => {
                let _ = writeln!(out, "  {ESEQ_WEAK}{} -> {path} (cancelled){ESEQ_RESET}", result.task.kind);
            }
            Outcome::Skipped => skipped += 1,
            _ if !result.task.is_repo_full_sync => {
                let _ = writeln!(out, "  {} -> {path}", result.task.kind);
            }
            _ => {}
        }
    }

    if skipped > 0 {
        let _ = writeln!(out, "  {ESEQ_WEAK}{skipped} unchanged{ESEQ_RESET}");
    }

    out
}

/// Render progress events on stdout until every sender is gone.
///
/// Runs on its own thread; only one batch at a time gets a spinner, the others are just
/// listed when they finish.
pub fn spawn_console(mut events: UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut active: Option<(Uuid, ProgressView)> = None;

        while let Some(event) = events.blocking_recv() {
            match event {
                ProgressEvent::Started { batch, total } => {
                    if active.is_some() {
                        debug!(%batch, "another batch owns the spinner");
                        continue;
                    }

                    let mut view = ProgressView::new(format!("Syncing {total} object(s)"));
                    view.start();
                    active = Some((batch, view));
                }
                ProgressEvent::TaskDone {
                    batch,
                    done,
                    total,
                    result,
                } => {
                    if let Some((_, view)) = active.as_mut().filter(|(id, _)| *id == batch) {
                        let path = result.task.local_path.display().to_string();
                        view.report_intermediate((done, total), Some(&path));
                    }
                }
                ProgressEvent::Finished { batch, results } => {
                    if active.as_ref().is_some_and(|(id, _)| *id == batch) {
                        if let Some((_, mut view)) = active.take() {
                            let failed = results.iter().filter(|result| result.outcome.is_failed()).count();
                            if failed == 0 {
                                view.success(None);
                            } else {
                                view.failure(Some(&format!("{failed} failed")));
                            }
                        }
                    }

                    print!("{}", render_results(&results));
                }
            }
        }
    })
}
