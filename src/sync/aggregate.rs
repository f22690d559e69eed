use std::{collections::HashMap, future::Future, mem, path::PathBuf, time::Duration};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error};

use super::task::ChangeEvent;

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending(Instant),
}

/// Collects events until nothing new has arrived for a whole window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
    pending: Vec<ChangeEvent>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Idle,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        self.pending.push(event);
        self.state = DebounceState::Pending(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Idle => None,
            DebounceState::Pending(deadline) => Some(deadline),
        }
    }

    /// Hands out the pending batch once the deadline has passed, leaving an empty one behind.
    pub fn take_if_due(&mut self, now: Instant) -> Option<Vec<ChangeEvent>> {
        match self.state {
            DebounceState::Pending(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<Vec<ChangeEvent>> {
        self.state = DebounceState::Idle;
        if self.pending.is_empty() {
            return None;
        }

        Some(mem::take(&mut self.pending))
    }
}

/// Debounce `events` of one watched root into batches sent on `batches`.
///
/// Ends when either side of the channel pair goes away; pending events are flushed first.
pub fn spawn_aggregator<T>(
    root: String,
    window: Duration,
    mut events: UnboundedReceiver<ChangeEvent>,
    batches: UnboundedSender<T>,
) -> JoinHandle<()>
where
    T: From<Vec<ChangeEvent>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut debouncer = Debouncer::new(window);

        loop {
            let deadline = debouncer.deadline();

            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        if let Some(batch) = debouncer.flush() {
                            let _ = batches.send(batch.into());
                        }
                        break;
                    };

                    debug!(repo = %root, kind = %event.kind, path = %event.local_path.display(), "change");
                    debouncer.push(event, Instant::now());
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let Some(batch) = debouncer.take_if_due(Instant::now()) else {
                        continue;
                    };

                    debug!(repo = %root, events = batch.len(), "batch ready");
                    if batches.send(batch.into()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Process jobs one at a time. A failing job is logged and the next one still runs.
pub async fn drain_batches<T, F, Fut>(root: &str, mut batches: UnboundedReceiver<T>, mut handle: F)
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    while let Some(batch) = batches.recv().await {
        if let Err(err) = handle(batch).await {
            error!(repo = %root, "sync failed: {err:#}");
        }
    }
}

/// Keep only the last event for each path, ordered by when that last event arrived.
pub fn coalesce(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut last_seen: HashMap<PathBuf, usize> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        last_seen.insert(event.local_path.clone(), index);
    }

    events
        .into_iter()
        .enumerate()
        .filter(|(index, event)| last_seen.get(&event.local_path) == Some(index))
        .map(|(_, event)| event)
        .collect()
}
