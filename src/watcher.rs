//! Watch directory monitoring
//!
//! Two sources feed the file queue: a startup sweep that walks the watch
//! directory recursively, and filesystem create events watched
//! non-recursively from then on. A newly created file is given a settle
//! delay before it is queued, so writers get a chance to finish; the delays
//! run in parallel, one task per file, and never hold up the event loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::alert::ActivityTracker;
use crate::config::Config;
use crate::sink::BatchSink;
use crate::Result;

/// Queue depth for raw filesystem events
const EVENT_CAPACITY: usize = 1024;

/// Feeds the worker queue from the watch directory
#[derive(Clone)]
pub struct Watcher {
    config: Arc<Config>,
    queue: mpsc::Sender<PathBuf>,
    activity: Arc<ActivityTracker>,
    sink: Arc<BatchSink>,
}

impl Watcher {
    pub fn new(
        config: Arc<Config>,
        queue: mpsc::Sender<PathBuf>,
        activity: Arc<ActivityTracker>,
        sink: Arc<BatchSink>,
    ) -> Self {
        Self {
            config,
            queue,
            activity,
            sink,
        }
    }

    /// Queue every file already sitting in the watch directory
    ///
    /// The walk is recursive, unlike the live watch, and skips ignored
    /// paths up front. When it finishes the sink is flushed so records
    /// buffered from a prior run go out without waiting on the flush window.
    pub async fn initial_sweep(&self) {
        info!(dir = %self.config.watch_dir, "sweeping for existing files");
        let mut found = 0u64;
        for entry in WalkDir::new(&self.config.watch_dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "walk error");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.into_path();
            if self.config.is_ignored(&path.display().to_string()) {
                debug!(path = %path.display(), "ignoring file");
                continue;
            }
            found += 1;
            self.enqueue(path).await;
        }
        info!(found, "sweep complete, flushing sink");
        self.sink.flush().await;
    }

    /// Watch for created files until the event stream closes
    pub async fn run(&self) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel::<notify::Result<Event>>(EVENT_CAPACITY);
        let mut fs_watcher = notify::recommended_watcher(move |event| {
            // A dropped receiver means shutdown, nothing to report.
            let _ = events_tx.blocking_send(event);
        })?;
        fs_watcher.watch(Path::new(&self.config.watch_dir), RecursiveMode::NonRecursive)?;
        info!(dir = %self.config.watch_dir, "watching for new files");

        let mut settles = JoinSet::new();
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(Ok(event)) => {
                            if matches!(event.kind, EventKind::Create(_)) {
                                for path in event.paths {
                                    let watcher = self.clone();
                                    settles.spawn(watcher.settle_and_queue(path));
                                }
                            }
                        }
                        Some(Err(err)) => warn!(error = %err, "watch error"),
                        None => break,
                    }
                }
                Some(settled) = settles.join_next() => {
                    if let Err(err) = settled {
                        warn!(error = %err, "settle task failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait out the settle delay, then queue the file
    async fn settle_and_queue(self, path: PathBuf) {
        debug!(
            path = %path.display(),
            secs = self.config.wait_interval_secs,
            "new file, settling"
        );
        tokio::time::sleep(Duration::from_secs(self.config.wait_interval_secs)).await;
        self.enqueue(path).await;
    }

    async fn enqueue(&self, path: PathBuf) {
        debug!(path = %path.display(), "queueing file");
        if self.queue.send(path).await.is_err() {
            warn!("file queue is closed");
            return;
        }
        self.activity.mark_input();
    }
}
