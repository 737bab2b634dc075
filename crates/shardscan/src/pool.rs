//! Worker pool executing partition scans.
//!
//! Each worker repeatedly takes a partition from the load balancer and
//! scans it to completion. The last worker to exit closes the balancer
//! and marks the scan completed, which closes the result queue once every
//! worker has dropped its sink.

use crate::balancer::LoadBalancer;
use crate::partition::{PartitionOutcome, PartitionScanner, ScanContext};
use crate::stream::{ResultSink, ScanControl, StopReason};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A fixed set of workers sharing one balancer.
pub struct WorkerPool {
    balancer: Arc<LoadBalancer>,
    ctx: Arc<ScanContext>,
    control: Arc<ScanControl>,
    workers: usize,
}

impl WorkerPool {
    /// Create a pool of `workers` workers. The balancer must have been
    /// created for the same number of workers.
    pub fn new(
        balancer: Arc<LoadBalancer>,
        ctx: Arc<ScanContext>,
        control: Arc<ScanControl>,
        workers: usize,
    ) -> Self {
        Self {
            balancer,
            ctx,
            control,
            workers: workers.max(1),
        }
    }

    /// Spawn the workers. Each gets its own clone of `sink`.
    pub fn spawn(self, sink: ResultSink) -> Vec<JoinHandle<WorkerExit>> {
        let remaining = Arc::new(AtomicUsize::new(self.workers));
        (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    balancer: Arc::clone(&self.balancer),
                    ctx: Arc::clone(&self.ctx),
                    control: Arc::clone(&self.control),
                    remaining: Arc::clone(&remaining),
                    sink: sink.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

/// Why a worker left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The balancer had nothing left to hand out.
    Drained,
    /// The worker re-queued a busy partition for another live worker.
    Yielded,
    /// The scan stopped.
    Stopped,
}

struct Worker {
    id: usize,
    balancer: Arc<LoadBalancer>,
    ctx: Arc<ScanContext>,
    control: Arc<ScanControl>,
    remaining: Arc<AtomicUsize>,
    sink: ResultSink,
}

impl Worker {
    async fn run(self) -> WorkerExit {
        let mut scanned = 0usize;
        let exit = loop {
            if self.control.is_stopped() {
                self.balancer.retire_worker();
                break WorkerExit::Stopped;
            }
            let Some(task) = self.balancer.select_partition() else {
                break WorkerExit::Drained;
            };

            self.balancer.task_starting(&task);
            let outcome = PartitionScanner::new(&self.ctx, task, &self.sink, &self.control)
                .run()
                .await;
            self.balancer.task_ended(&task);

            match outcome {
                PartitionOutcome::Complete | PartitionOutcome::Skipped => scanned += 1,
                PartitionOutcome::Retry(err) => {
                    debug!(worker = self.id, partition = %task.partition, error = %err, "re-queueing partition");
                    if self.balancer.retry_task_and_yield(task) {
                        debug!(worker = self.id, "yielding to remaining workers");
                        break WorkerExit::Yielded;
                    }
                }
                PartitionOutcome::Cancelled => {
                    self.balancer.retire_worker();
                    break WorkerExit::Stopped;
                }
                PartitionOutcome::Fatal(err) => {
                    if !self.control.fail(err.clone()) {
                        debug!(worker = self.id, error = %err, "scan already stopped, dropping error");
                    }
                    self.balancer.retire_worker();
                    break WorkerExit::Stopped;
                }
            }
        };

        debug!(worker = self.id, partitions = scanned, exit = ?exit, "worker exiting");
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.balancer.close();
            if self.control.stop(StopReason::Completed) {
                info!(items = self.control.delivered(), "scan completed");
            }
        }
        exit
    }
}
