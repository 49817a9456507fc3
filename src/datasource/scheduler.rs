use futures::future::BoxFuture;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{DalError, Result};

type Job = BoxFuture<'static, ()>;

/// Single-worker job queue
///
/// Jobs run one at a time in submission order on a dedicated tokio task.
pub struct RefreshScheduler {
    name: String,
    jobs: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl RefreshScheduler {
    /// Starts the worker on `runtime`.
    pub fn start(name: impl Into<String>, runtime: &Handle) -> Self {
        let name = name.into();
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let worker_name = name.clone();
        let worker = runtime.spawn(async move {
            while let Some(job) = queue.recv().await {
                job.await;
            }
            debug!(scheduler = %worker_name, "refresh scheduler drained");
        });
        debug!(scheduler = %name, "refresh scheduler started");

        Self { name, jobs, worker }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job behind every previously scheduled one.
    pub fn schedule<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.jobs.send(Box::pin(job)).map_err(|_| {
            DalError::SchedulerUnavailable(format!("scheduler '{}' has stopped", self.name))
        })
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
