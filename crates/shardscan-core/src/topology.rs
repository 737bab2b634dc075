//! Partition placement.
//!
//! The engine reads the cluster layout through `TopologySnapshot`, obtained
//! once per scan from a `TopologyProvider`, and copies it into a
//! `PlacementMap` so the rest of the scan works from an immutable view.

use crate::error::{ScanError, ScanResult};
use crate::types::{NodeIndex, PartitionId, PartitionTask};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// A point-in-time view of which node owns which partitions.
pub trait TopologySnapshot: Send + Sync {
    /// Total number of partitions in the bucket.
    fn num_partitions(&self) -> usize;

    /// Number of nodes in the snapshot.
    fn num_nodes(&self) -> usize;

    /// Partitions whose active copy lives on `node`.
    fn partitions_on_node(&self, node: NodeIndex) -> ScanResult<Vec<PartitionId>>;
}

/// Source of topology snapshots.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Wait for and return the current snapshot.
    async fn snapshot(&self) -> ScanResult<Arc<dyn TopologySnapshot>>;
}

/// Immutable node-to-partitions map taken from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementMap {
    nodes: Vec<Vec<PartitionId>>,
    num_partitions: usize,
}

impl PlacementMap {
    /// Build a placement map directly from per-node partition lists.
    ///
    /// Index `i` of `nodes` lists the partitions owned by node `i`.
    pub fn new(nodes: Vec<Vec<PartitionId>>) -> ScanResult<Self> {
        let mut seen = HashSet::new();
        for (index, partitions) in nodes.iter().enumerate() {
            for partition in partitions {
                if !seen.insert(*partition) {
                    return Err(ScanError::Topology(format!(
                        "partition {} is placed on more than one node (again on node-{})",
                        partition, index
                    )));
                }
            }
        }
        let num_partitions = seen.len();
        Ok(Self {
            nodes,
            num_partitions,
        })
    }

    /// Copy a snapshot into a placement map.
    pub fn from_snapshot(snapshot: &dyn TopologySnapshot) -> ScanResult<Self> {
        if snapshot.num_partitions() == 0 {
            return Err(ScanError::InvalidArgument(
                "scans can only be used with partitioned buckets".into(),
            ));
        }
        let nodes = (0..snapshot.num_nodes())
            .map(|i| snapshot.partitions_on_node(NodeIndex::new(i)))
            .collect::<ScanResult<Vec<_>>>()?;
        Self::new(nodes)
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of distinct partitions placed on some node.
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Partitions owned by `node`, empty for unknown nodes.
    pub fn partitions_on(&self, node: NodeIndex) -> &[PartitionId] {
        self.nodes
            .get(node.as_usize())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every task in the map, node by node.
    pub fn tasks(&self) -> Vec<PartitionTask> {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(i, partitions)| {
                partitions
                    .iter()
                    .map(move |p| PartitionTask::new(*p, NodeIndex::new(i)))
            })
            .collect()
    }
}

impl TopologySnapshot for PlacementMap {
    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn partitions_on_node(&self, node: NodeIndex) -> ScanResult<Vec<PartitionId>> {
        self.nodes
            .get(node.as_usize())
            .cloned()
            .ok_or_else(|| ScanError::Topology(format!("{} is not in the snapshot", node)))
    }
}
