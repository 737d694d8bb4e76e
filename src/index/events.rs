//! Change-notification plumbing: a bounded event queue with debounce
//! coalescing, feeding a worker pool that applies events through the
//! [`IndexManager`](super::IndexManager).
//!
//! Delivery from the watcher is at-least-once and may be duplicated or
//! reordered; everything downstream is written to tolerate that.

use super::IndexManager;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { from: PathBuf },
}

/// One file-system change notification.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn now(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Producer side of the bounded notification queue. When the queue is
/// saturated the event is dropped and a full rescan is flagged instead,
/// trading precision for bounded memory.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChangeEvent>,
    rescan_needed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn push(&self, event: ChangeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(path = %ev.path.display(), "event queue saturated, scheduling full rescan");
                self.rescan_needed.store(true, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event queue closed, dropping event");
            }
        }
    }
}

/// Bounded queue: returns the sink handed to watchers and the receiver
/// consumed by [`run_event_loop`].
pub fn event_queue(capacity: usize) -> (EventSink, mpsc::Receiver<ChangeEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSink {
            tx,
            rescan_needed: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Coalescing window for events on the same path.
    pub debounce: Duration,
    /// Parallel per-file workers.
    pub max_concurrency: usize,
    /// Retries after a failed apply, with exponential backoff.
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            max_concurrency: 4,
            max_retries: 5,
            retry_base: Duration::from_secs(2),
        }
    }
}

struct Pending {
    kind: ChangeKind,
    due: Instant,
}

/// Consume the event queue until cancellation or channel close.
///
/// Rapid events for one path coalesce to a single effective event carrying
/// the latest kind. Effective events fan out to a semaphore-bounded worker
/// pool; per-path ordering is enforced by the manager's path locks. A
/// saturation-triggered rescan reindexes every root in `rescan_roots`
/// through the normal bulk path.
pub async fn run_event_loop(
    manager: Arc<IndexManager>,
    mut rx: mpsc::Receiver<ChangeEvent>,
    sink: EventSink,
    rescan_roots: Vec<PathBuf>,
    config: EventLoopConfig,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut closed = false;

    loop {
        let next_due = pending.values().map(|p| p.due).min();

        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv(), if !closed => match event {
                Some(event) => coalesce(&mut pending, event, config.debounce),
                None => closed = true,
            },
            () = sleep_until_opt(next_due), if next_due.is_some() || closed => {}
        }

        let now = Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, p)| closed || p.due <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            let Some(Pending { kind, .. }) = pending.remove(&path) else {
                continue;
            };
            let manager = manager.clone();
            let semaphore = semaphore.clone();
            let config = config.clone();
            workers.spawn(async move {
                apply_with_retry(&manager, path, kind, &semaphore, &config).await;
            });
        }

        // Reap finished workers without blocking the loop.
        while workers.try_join_next().is_some() {}

        if sink.rescan_needed.swap(false, Ordering::SeqCst) {
            for root in &rescan_roots {
                info!(root = %root.display(), "running full rescan after queue saturation");
                let manager = manager.clone();
                let root = root.clone();
                workers.spawn(async move {
                    if let Err(e) = manager.index_directory(&root, true, None).await {
                        warn!("rescan failed: {e}");
                    }
                });
            }
        }

        if closed && pending.is_empty() {
            break;
        }
    }

    // Let in-flight work finish so no FileRecord is left half-applied.
    while workers.join_next().await.is_some() {}
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Merge an incoming event into the pending map: the latest kind wins and
/// the coalescing window restarts. Renames expand to a delete of the old
/// path plus a create of the new one.
fn coalesce(pending: &mut HashMap<PathBuf, Pending>, event: ChangeEvent, debounce: Duration) {
    let due = Instant::now() + debounce;
    match event.kind {
        ChangeKind::Renamed { from } => {
            pending.insert(
                from,
                Pending {
                    kind: ChangeKind::Deleted,
                    due,
                },
            );
            pending.insert(
                event.path,
                Pending {
                    kind: ChangeKind::Created,
                    due,
                },
            );
        }
        kind => {
            pending.insert(event.path, Pending { kind, due });
        }
    }
}

async fn apply_with_retry(
    manager: &IndexManager,
    path: PathBuf,
    kind: ChangeKind,
    semaphore: &Semaphore,
    config: &EventLoopConfig,
) {
    for attempt in 0..=config.max_retries {
        let result = {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            manager.apply_event(&path, kind.clone()).await
        };

        match result {
            Ok(()) => return,
            Err(e) if attempt == config.max_retries => {
                manager.mark_failed(&path, &e.to_string());
                return;
            }
            Err(e) => {
                let delay = config.retry_base * 2u32.pow(attempt);
                warn!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    "indexing failed ({e}), retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
