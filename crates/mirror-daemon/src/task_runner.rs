//! Bounded worker pool for I/O-heavy ensure operations.
//!
//! A fixed set of workers drains a FIFO queue of boxed futures. Scheduling
//! blocks while the queue is full and silently drops tasks once the pool
//! has stopped — the next full sync re-converges anything that was still in
//! flight. Task errors are logged and never terminate a worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

const QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_WORKERS: usize = 4;

type Task = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

#[derive(Default)]
pub struct TaskRunner {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `worker_count` workers over a fresh queue.
    pub async fn start(&self, worker_count: usize) {
        let (tx, rx) = mpsc::channel::<Task>(QUEUE_CAPACITY);
        *self.tx.lock().await = Some(tx);

        let rx = Arc::new(Mutex::new(rx));
        let mut workers = self.workers.lock().await;
        for id in 0..worker_count {
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => {
                            if let Err(e) = task.await {
                                error!(worker = id, error = %e, "task execution failed");
                            }
                        }
                        None => break,
                    }
                }
            }));
        }
    }

    /// Queue a task. Waits while the queue is full; after [`stop`] the task
    /// is dropped.
    ///
    /// [`stop`]: TaskRunner::stop
    pub async fn schedule<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let tx = self.tx.lock().await.clone();
        match tx {
            Some(tx) => {
                if tx.send(Box::pin(task)).await.is_err() {
                    debug!("task queue closed, dropping task");
                }
            }
            None => debug!("task runner not running, dropping task"),
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn stop(&self) {
        self.tx.lock().await.take();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker terminated abnormally");
            }
        }
    }
}
