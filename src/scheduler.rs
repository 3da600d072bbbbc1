//! Bounded execution of inbound frame handlers.
//!
//! Two counting semaphores gate every task: an admission permit is taken on
//! the submitting side (so intake blocks once `admission` tasks are queued or
//! running), and a worker permit is taken inside the spawned task (so at most
//! `workers` handlers execute at once). Ordering across tasks is not preserved.

use crate::config::SchedulerConfig;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct MessageScheduler {
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    admission_capacity: usize,
    worker_capacity: usize,
}

impl MessageScheduler {
    pub fn new(workers: usize, admission: usize) -> Self {
        let workers = workers.max(1);
        let admission = admission.max(workers);
        Self {
            admission: Arc::new(Semaphore::new(admission)),
            workers: Arc::new(Semaphore::new(workers)),
            admission_capacity: admission,
            worker_capacity: workers,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.workers, config.admission)
    }

    /// Admit `task` and run it on the worker pool.
    ///
    /// Waits while the admission capacity is exhausted. Returns `false` once
    /// the scheduler has been closed.
    pub async fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let admitted = match Arc::clone(&self.admission).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let _admitted = admitted;
            let Ok(_worker) = workers.acquire_owned().await else {
                return;
            };
            task.await;
        });
        true
    }

    /// Tasks admitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.admission_capacity - self.admission.available_permits()
    }

    /// Tasks currently holding a worker slot.
    pub fn running(&self) -> usize {
        self.worker_capacity - self.workers.available_permits()
    }

    pub fn worker_capacity(&self) -> usize {
        self.worker_capacity
    }

    pub fn admission_capacity(&self) -> usize {
        self.admission_capacity
    }

    /// Wait until every admitted task has finished.
    pub async fn drain(&self) {
        let Ok(total) = u32::try_from(self.admission_capacity) else {
            return;
        };
        if let Ok(all) = self.admission.acquire_many(total).await {
            drop(all);
        }
    }

    /// Refuse further submissions. Tasks already admitted keep running.
    pub fn close(&self) {
        self.admission.close();
    }
}

impl Default for MessageScheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}
