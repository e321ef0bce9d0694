//! Fixed-size worker pool over a shared file queue
//!
//! The watcher pushes paths into one FIFO; a fixed set of workers drains
//! it. Capping the worker count caps how many files are open at once no
//! matter how fast files arrive.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Queue depth for paths waiting on a worker
const QUEUE_CAPACITY: usize = 1024;

/// Work accepted by pool workers
#[async_trait]
pub trait FileHandler: Send + Sync {
    /// Handle one queued path; implementations log their own failures
    async fn handle(&self, path: PathBuf);
}

/// Fixed set of workers draining one shared FIFO of file paths
pub struct WorkerPool {
    tx: mpsc::Sender<PathBuf>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers (at least one) over a fresh queue
    pub fn start(size: usize, handler: Arc<dyn FileHandler>) -> Self {
        let (tx, rx) = mpsc::channel::<PathBuf>(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));

        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            workers.push(tokio::spawn(async move {
                loop {
                    // Lock only to receive; handling runs unlocked so the
                    // other workers keep draining.
                    let path = { rx.lock().await.recv().await };
                    match path {
                        Some(path) => {
                            debug!(worker = id, path = %path.display(), "picked up file");
                            handler.handle(path).await;
                        }
                        None => break,
                    }
                }
            }));
        }

        Self { tx, workers }
    }

    /// Sender half of the queue, for whoever finds files
    pub fn queue(&self) -> mpsc::Sender<PathBuf> {
        self.tx.clone()
    }

    /// Close the queue and wait for the workers to finish what they hold
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker ended abnormally");
            }
        }
    }
}
