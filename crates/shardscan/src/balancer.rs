//! Load balancer assigning partitions to scan workers.
//!
//! Each node has a queue of partitions still to scan and a count of scans
//! currently running against it. Both live in one record per node behind a
//! single lock, so the active count always matches what the queues have
//! handed out.
//!
//! The balancer also tracks how many workers are still pulling from it.
//! A worker retires atomically with observing an empty balancer, and a
//! worker that re-queues after a busy signal only retires when another
//! worker is still live to pick the partition up again.

use shardscan_core::topology::PlacementMap;
use shardscan_core::types::{NodeIndex, PartitionTask};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

/// Queue and activity counter for one node.
#[derive(Debug, Clone)]
struct NodeSlot {
    node: NodeIndex,
    queue: VecDeque<PartitionTask>,
    active: usize,
}

#[derive(Debug)]
struct BalancerState {
    nodes: Vec<NodeSlot>,
    live_workers: usize,
    closed: bool,
}

/// Distributes partitions across workers, favouring the least busy node.
#[derive(Debug)]
pub struct LoadBalancer {
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    /// Create a balancer for `placement`, shuffling each node's partitions with `seed`.
    ///
    /// `workers` is the number of workers that will pull from the balancer.
    pub fn new(placement: &PlacementMap, seed: u64, workers: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let nodes = (0..placement.num_nodes())
            .map(|i| {
                let node = NodeIndex::new(i);
                let mut partitions = placement.partitions_on(node).to_vec();
                partitions.shuffle(&mut rng);
                NodeSlot {
                    node,
                    queue: partitions
                        .into_iter()
                        .map(|p| PartitionTask::new(p, node))
                        .collect(),
                    active: 0,
                }
            })
            .collect();

        Self {
            state: Mutex::new(BalancerState {
                nodes,
                live_workers: workers,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BalancerState> {
        // A panic while holding the lock cannot leave the counters half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the next partition to scan.
    ///
    /// Picks the head of the queue of the node with the fewest active scans,
    /// among nodes that still have queued partitions. Ties go to the lowest
    /// node index. Returns `None` once every queue is empty or the balancer
    /// is closed, and retires the calling worker in the same step.
    pub fn select_partition(&self) -> Option<PartitionTask> {
        let mut state = self.lock();
        if !state.closed {
            let mut best: Option<usize> = None;
            for (i, slot) in state.nodes.iter().enumerate() {
                if slot.queue.is_empty() {
                    continue;
                }
                match best {
                    Some(b) if state.nodes[b].active <= slot.active => {}
                    _ => best = Some(i),
                }
            }
            if let Some(i) = best {
                return state.nodes[i].queue.pop_front();
            }
        }
        state.live_workers = state.live_workers.saturating_sub(1);
        None
    }

    /// Record that a scan of `task` is starting.
    pub fn task_starting(&self, task: &PartitionTask) {
        let mut state = self.lock();
        if let Some(slot) = state.nodes.get_mut(task.node.as_usize()) {
            slot.active += 1;
        }
    }

    /// Record that the scan of `task` ended, whatever the outcome.
    pub fn task_ended(&self, task: &PartitionTask) {
        let mut state = self.lock();
        if let Some(slot) = state.nodes.get_mut(task.node.as_usize()) {
            if slot.active == 0 {
                warn!(node = %task.node, partition = %task.partition, "task ended with no active scans recorded");
                return;
            }
            slot.active -= 1;
        }
    }

    /// Put `task` back on its own node's queue.
    pub fn retry_task(&self, task: PartitionTask) {
        let mut state = self.lock();
        Self::requeue(&mut state, task);
    }

    /// Put `task` back and decide whether the calling worker should stop.
    ///
    /// Returns `true`, retiring the caller, when another worker is still
    /// live to pick the task up. The last live worker always keeps going.
    pub fn retry_task_and_yield(&self, task: PartitionTask) -> bool {
        let mut state = self.lock();
        Self::requeue(&mut state, task);
        if state.live_workers > 1 {
            state.live_workers -= 1;
            true
        } else {
            false
        }
    }

    fn requeue(state: &mut BalancerState, task: PartitionTask) {
        if state.closed {
            debug!(partition = %task.partition, "balancer closed, dropping retry");
            return;
        }
        match state.nodes.get_mut(task.node.as_usize()) {
            Some(slot) if slot.node == task.node => slot.queue.push_back(task),
            _ => warn!(node = %task.node, partition = %task.partition, "retry for unknown node"),
        }
    }

    /// Retire a worker that is leaving without draining the balancer.
    pub fn retire_worker(&self) {
        let mut state = self.lock();
        state.live_workers = state.live_workers.saturating_sub(1);
    }

    /// Discard all queues. Later selections return `None`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for slot in state.nodes.iter_mut() {
            slot.queue.clear();
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of scans running against `node`.
    pub fn active_scans(&self, node: NodeIndex) -> usize {
        self.lock()
            .nodes
            .get(node.as_usize())
            .map(|slot| slot.active)
            .unwrap_or(0)
    }

    /// Number of scans running across all nodes.
    pub fn total_active(&self) -> usize {
        self.lock().nodes.iter().map(|slot| slot.active).sum()
    }

    /// Number of partitions still queued across all nodes.
    pub fn queued(&self) -> usize {
        self.lock().nodes.iter().map(|slot| slot.queue.len()).sum()
    }

    /// Number of workers that have not retired.
    pub fn live_workers(&self) -> usize {
        self.lock().live_workers
    }

    /// Queued partitions of one node, in dispatch order.
    pub fn queued_on(&self, node: NodeIndex) -> Vec<PartitionTask> {
        self.lock()
            .nodes
            .get(node.as_usize())
            .map(|slot| slot.queue.iter().copied().collect())
            .unwrap_or_default()
    }
}
