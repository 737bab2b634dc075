//! In-memory cluster for tests and benchmarks.
//!
//! `SimulatedCluster` implements every collaborator the engine needs:
//! topology snapshots, the scan session transport, and collection id
//! resolution. Documents are routed to partitions by hashing their keys,
//! or placed explicitly. Faults and latency can be injected per partition,
//! and every create, cancel and session is recorded for inspection.
//!
//! # Example
//!
//! ```
//! use shardscan::sim::SimulatedCluster;
//!
//! let cluster = SimulatedCluster::new(2, 8);
//! cluster.upsert("airline_10", r#"{"name":"40-Mile Air"}"#);
//! assert_eq!(cluster.document_count(), 1);
//! ```

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shardscan_core::error::{ScanError, ScanResult, TransportError, TransportErrorKind};
use shardscan_core::scan::{CreateScan, ScanRequest};
use shardscan_core::topology::{PlacementMap, TopologyProvider, TopologySnapshot};
use shardscan_core::transport::{CollectionIdResolver, ScanBatch, ScanTransport};
use shardscan_core::types::{
    Keyspace, MutationToken, NodeIndex, PartitionId, ScanHandle, ScanItem,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Bucket name used by simulated clusters.
pub const SIM_BUCKET: &str = "sim";

/// First id handed out to named collections.
const FIRST_COLLECTION_ID: u32 = 8;

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDocument {
    pub value: Vec<u8>,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
}

/// A `create` call as received by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRecord {
    pub node: NodeIndex,
    pub partition: PartitionId,
    pub scan: CreateScan,
}

#[derive(Debug)]
struct Session {
    node: NodeIndex,
    partition: PartitionId,
    pending: VecDeque<ScanItem>,
    batches: usize,
}

#[derive(Debug, Clone, Copy)]
struct ContinueFault {
    kind: TransportErrorKind,
    after_batches: usize,
}

#[derive(Debug, Default)]
struct PartitionHistory {
    uuid: u64,
    seq_no: u64,
}

#[derive(Debug)]
struct SimState {
    placement: PlacementMap,
    num_partitions: u16,
    /// Documents by collection id, then partition, then key.
    docs: HashMap<u32, Vec<BTreeMap<Vec<u8>, SimDocument>>>,
    history: Vec<PartitionHistory>,
    collections: HashMap<(String, String), u32>,
    next_collection_id: u32,
    next_cas: u64,
    sessions: HashMap<ScanHandle, Session>,
    active_per_node: Vec<usize>,
    max_active_per_node: Vec<usize>,
    create_faults: HashMap<PartitionId, (TransportErrorKind, usize)>,
    continue_faults: HashMap<PartitionId, ContinueFault>,
    latency: Duration,
    snapshot_delay: Duration,
    create_log: Vec<CreateRecord>,
    cancels: usize,
    continues: usize,
    snapshot_requests: usize,
}

/// An in-memory partitioned cluster.
#[derive(Debug)]
pub struct SimulatedCluster {
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    /// Create a cluster of `num_nodes` nodes with partitions assigned round robin.
    ///
    /// # Panics
    ///
    /// Panics if `num_nodes` is 0.
    pub fn new(num_nodes: usize, num_partitions: u16) -> Self {
        assert!(num_nodes > 0, "Number of nodes must be greater than 0");
        let mut nodes = vec![Vec::new(); num_nodes];
        for p in 0..num_partitions {
            nodes[usize::from(p) % num_nodes].push(PartitionId::new(p));
        }
        let placement = match PlacementMap::new(nodes) {
            Ok(placement) => placement,
            Err(_) => unreachable!("round robin placement has no duplicates"),
        };
        Self::from_placement(placement, num_partitions)
    }

    /// Create a cluster with an explicit placement: index `i` lists node `i`'s partitions.
    pub fn with_placement(nodes: Vec<Vec<u16>>) -> ScanResult<Self> {
        let num_partitions = nodes
            .iter()
            .flatten()
            .max()
            .map_or(0, |max| max.saturating_add(1));
        let placement = PlacementMap::new(
            nodes
                .into_iter()
                .map(|ps| ps.into_iter().map(PartitionId::new).collect())
                .collect(),
        )?;
        Ok(Self::from_placement(placement, num_partitions))
    }

    fn from_placement(placement: PlacementMap, num_partitions: u16) -> Self {
        let num_nodes = placement.num_nodes();
        let mut docs = HashMap::new();
        docs.insert(0, Self::empty_partitions(num_partitions));
        let history = (0..num_partitions)
            .map(|p| PartitionHistory {
                uuid: 0x5eed_0000 + u64::from(p),
                seq_no: 0,
            })
            .collect();

        Self {
            state: Mutex::new(SimState {
                placement,
                num_partitions,
                docs,
                history,
                collections: HashMap::new(),
                next_collection_id: FIRST_COLLECTION_ID,
                next_cas: 1,
                sessions: HashMap::new(),
                active_per_node: vec![0; num_nodes],
                max_active_per_node: vec![0; num_nodes],
                create_faults: HashMap::new(),
                continue_faults: HashMap::new(),
                latency: Duration::ZERO,
                snapshot_delay: Duration::ZERO,
                create_log: Vec::new(),
                cancels: 0,
                continues: 0,
                snapshot_requests: 0,
            }),
        }
    }

    fn empty_partitions(num_partitions: u16) -> Vec<BTreeMap<Vec<u8>, SimDocument>> {
        (0..num_partitions).map(|_| BTreeMap::new()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &[u8]) -> PartitionId {
        let num_partitions = self.lock().num_partitions.max(1);
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        PartitionId::new((hasher.finish() % u64::from(num_partitions)) as u16)
    }

    /// Keyspace of the default collection.
    pub fn default_keyspace(&self) -> Keyspace {
        Keyspace::default_collection(SIM_BUCKET)
    }

    /// Register a named collection and return its id.
    pub fn add_collection(&self, scope: &str, collection: &str) -> u32 {
        let mut state = self.lock();
        if let Some(id) = state.collections.get(&(scope.to_string(), collection.to_string())) {
            return *id;
        }
        let id = state.next_collection_id;
        state.next_collection_id += 1;
        state
            .collections
            .insert((scope.to_string(), collection.to_string()), id);
        let partitions = Self::empty_partitions(state.num_partitions);
        state.docs.insert(id, partitions);
        id
    }

    /// Store a document in the default collection, routed by key.
    pub fn upsert(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> MutationToken {
        let key = key.into();
        let partition = self.partition_for(&key);
        self.insert_into(0, partition, key, value)
    }

    /// Store a document in a given collection and partition.
    ///
    /// Unknown collections and partitions are created or clamped so that
    /// fixtures never fail.
    pub fn insert_into(
        &self,
        collection_id: u32,
        partition: PartitionId,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> MutationToken {
        let mut state = self.lock();
        let num_partitions = state.num_partitions;
        let index = usize::from(partition.as_u16()) % usize::from(num_partitions.max(1));
        let cas = state.next_cas;
        state.next_cas += 1;

        let partitions = state
            .docs
            .entry(collection_id)
            .or_insert_with(|| Self::empty_partitions(num_partitions));
        if let Some(docs) = partitions.get_mut(index) {
            docs.insert(
                key.into(),
                SimDocument {
                    value: value.into(),
                    cas,
                    flags: 0,
                    expiry: 0,
                },
            );
        }

        let (uuid, seq_no) = match state.history.get_mut(index) {
            Some(history) => {
                history.seq_no += 1;
                (history.uuid, history.seq_no)
            }
            None => (0, 0),
        };
        MutationToken {
            bucket: SIM_BUCKET.to_string(),
            partition: PartitionId::new(index as u16),
            partition_uuid: uuid,
            seq_no,
        }
    }

    /// Number of documents across every collection.
    pub fn document_count(&self) -> usize {
        self.lock()
            .docs
            .values()
            .flat_map(|partitions| partitions.iter().map(BTreeMap::len))
            .sum()
    }

    /// Fail the next `times` creates on `partition` with `kind`.
    pub fn fail_create(&self, partition: PartitionId, kind: TransportErrorKind, times: usize) {
        self.lock().create_faults.insert(partition, (kind, times));
    }

    /// Fail one continue on `partition` with `kind` after `after_batches`
    /// batches of a session were served. The session is dropped.
    pub fn fail_continue(&self, partition: PartitionId, kind: TransportErrorKind, after_batches: usize) {
        self.lock().continue_faults.insert(
            partition,
            ContinueFault {
                kind,
                after_batches,
            },
        );
    }

    /// Delay every create and continue by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Delay topology snapshots by `delay`.
    pub fn set_snapshot_delay(&self, delay: Duration) {
        self.lock().snapshot_delay = delay;
    }

    /// Every create received, in arrival order.
    pub fn create_log(&self) -> Vec<CreateRecord> {
        self.lock().create_log.clone()
    }

    /// Number of cancel calls received.
    pub fn cancel_count(&self) -> usize {
        self.lock().cancels
    }

    /// Number of continue calls received.
    pub fn continue_count(&self) -> usize {
        self.lock().continues
    }

    /// Number of topology snapshots requested.
    pub fn snapshot_requests(&self) -> usize {
        self.lock().snapshot_requests
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Most sessions ever open at once on `node`.
    pub fn max_concurrent_sessions(&self, node: NodeIndex) -> usize {
        self.lock()
            .max_active_per_node
            .get(node.as_usize())
            .copied()
            .unwrap_or(0)
    }

    fn close_session(state: &mut SimState, handle: &ScanHandle) -> Option<Session> {
        let session = state.sessions.remove(handle)?;
        if let Some(active) = state.active_per_node.get_mut(session.node.as_usize()) {
            *active = active.saturating_sub(1);
        }
        Some(session)
    }

    fn open_session(
        state: &mut SimState,
        node: NodeIndex,
        partition: PartitionId,
        scan: &CreateScan,
    ) -> Result<ScanHandle, TransportError> {
        if let Some((kind, left)) = state.create_faults.get_mut(&partition) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::new(*kind, format!("injected on {}", partition)));
            }
        }

        let index = usize::from(partition.as_u16());
        if let (Some(required), Some(history)) = (scan.snapshot, state.history.get(index)) {
            if required.partition_uuid != history.uuid {
                return Err(TransportError::new(
                    TransportErrorKind::Other,
                    format!("partition uuid mismatch on {}", partition),
                ));
            }
            if required.seq_no > history.seq_no {
                return Err(TransportError::of(TransportErrorKind::TemporaryFailure));
            }
        }

        let docs = state
            .docs
            .get(&scan.collection_id)
            .ok_or_else(|| TransportError::of(TransportErrorKind::CollectionNotFound))?
            .get(index)
            .ok_or_else(|| TransportError::of(TransportErrorKind::NotMyVbucket))?;

        let selected: Vec<(&Vec<u8>, &SimDocument)> = match &scan.request {
            ScanRequest::Range { .. } => docs
                .iter()
                .filter(|(key, _)| scan.request.contains(key))
                .collect(),
            ScanRequest::Sampling { limit, seed } => {
                if docs.is_empty() {
                    return Err(TransportError::of(TransportErrorKind::DocumentNotFound));
                }
                let mut all: Vec<_> = docs.iter().collect();
                let mut rng = StdRng::seed_from_u64(seed ^ u64::from(partition.as_u16()));
                all.shuffle(&mut rng);
                all.truncate(usize::try_from(*limit).unwrap_or(usize::MAX));
                all.sort_by(|a, b| a.0.cmp(b.0));
                all
            }
        };

        let pending = selected
            .into_iter()
            .map(|(key, doc)| {
                if scan.ids_only {
                    ScanItem::id_only(key.clone())
                } else {
                    ScanItem {
                        key: key.clone(),
                        cas: doc.cas,
                        flags: doc.flags,
                        value: Some(doc.value.clone()),
                        expiry: doc.expiry,
                    }
                }
            })
            .collect();

        let handle = ScanHandle::new();
        state.sessions.insert(
            handle,
            Session {
                node,
                partition,
                pending,
                batches: 0,
            },
        );
        if let Some(active) = state.active_per_node.get_mut(node.as_usize()) {
            *active += 1;
            let active = *active;
            if let Some(max) = state.max_active_per_node.get_mut(node.as_usize()) {
                *max = (*max).max(active);
            }
        }
        Ok(handle)
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl TopologyProvider for SimulatedCluster {
    async fn snapshot(&self) -> ScanResult<Arc<dyn TopologySnapshot>> {
        let delay = {
            let mut state = self.lock();
            state.snapshot_requests += 1;
            state.snapshot_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let placement = self.lock().placement.clone();
        Ok(Arc::new(placement))
    }
}

#[async_trait]
impl ScanTransport for SimulatedCluster {
    async fn create(
        &self,
        node: NodeIndex,
        partition: PartitionId,
        scan: &CreateScan,
    ) -> Result<ScanHandle, TransportError> {
        self.delay().await;
        let mut state = self.lock();
        state.create_log.push(CreateRecord {
            node,
            partition,
            scan: scan.clone(),
        });
        let handle = Self::open_session(&mut state, node, partition, scan)?;
        trace!(%node, %partition, %handle, "session opened");
        Ok(handle)
    }

    async fn continue_scan(
        &self,
        _node: NodeIndex,
        handle: &ScanHandle,
        item_limit: u32,
        byte_limit: u32,
    ) -> Result<ScanBatch, TransportError> {
        self.delay().await;
        let mut state = self.lock();
        state.continues += 1;

        let (partition, batches) = match state.sessions.get(handle) {
            Some(session) => (session.partition, session.batches),
            None => {
                return Err(TransportError::new(
                    TransportErrorKind::ScanCancelled,
                    format!("unknown scan {}", handle),
                ))
            }
        };
        if let Some(fault) = state.continue_faults.get(&partition).copied() {
            if batches >= fault.after_batches {
                state.continue_faults.remove(&partition);
                Self::close_session(&mut state, handle);
                return Err(TransportError::new(fault.kind, format!("injected on {}", partition)));
            }
        }

        let Some(session) = state.sessions.get_mut(handle) else {
            return Err(TransportError::of(TransportErrorKind::ScanCancelled));
        };
        session.batches += 1;
        let mut items = Vec::new();
        let mut bytes = 0usize;
        while let Some(item) = session.pending.front() {
            let size = item.key.len() + item.value.as_ref().map_or(0, Vec::len);
            if !items.is_empty()
                && (items.len() >= item_limit as usize || bytes + size > byte_limit as usize)
            {
                break;
            }
            bytes += size;
            if let Some(item) = session.pending.pop_front() {
                items.push(item);
            }
        }

        if session.pending.is_empty() {
            Self::close_session(&mut state, handle);
            Ok(ScanBatch::last(items))
        } else {
            Ok(ScanBatch::more(items))
        }
    }

    async fn cancel(&self, _node: NodeIndex, handle: &ScanHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.cancels += 1;
        match Self::close_session(&mut state, handle) {
            Some(_) => Ok(()),
            None => Err(TransportError::new(
                TransportErrorKind::Other,
                format!("no open scan {}", handle),
            )),
        }
    }
}

#[async_trait]
impl CollectionIdResolver for SimulatedCluster {
    async fn collection_id(&self, scope: &str, collection: &str) -> ScanResult<u32> {
        if scope == Keyspace::DEFAULT && collection == Keyspace::DEFAULT {
            return Ok(0);
        }
        self.lock()
            .collections
            .get(&(scope.to_string(), collection.to_string()))
            .copied()
            .ok_or_else(|| ScanError::CollectionNotFound {
                scope: scope.to_string(),
                collection: collection.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardscan_core::scan::ScanTerm;

    fn full_range(ids_only: bool) -> CreateScan {
        CreateScan {
            collection_id: 0,
            request: ScanRequest::Range {
                start: ScanTerm::minimum(),
                end: ScanTerm::maximum(),
            },
            snapshot: None,
            ids_only,
        }
    }

    #[test]
    fn test_round_robin_placement() {
        let cluster = SimulatedCluster::new(3, 7);
        let placement = cluster.lock().placement.clone();
        assert_eq!(placement.num_partitions(), 7);
        assert_eq!(placement.partitions_on(NodeIndex::new(0)).len(), 3);
        assert_eq!(placement.partitions_on(NodeIndex::new(2)).len(), 2);
    }

    #[test]
    fn test_routing_is_stable() {
        let cluster = SimulatedCluster::new(2, 16);
        let first = cluster.partition_for(b"airline_10");
        assert_eq!(cluster.partition_for(b"airline_10"), first);
        assert!(first.as_u16() < 16);
    }

    #[test]
    fn test_mutation_tokens_advance() {
        let cluster = SimulatedCluster::new(1, 4);
        let a = cluster.insert_into(0, PartitionId::new(2), "a", "1");
        let b = cluster.insert_into(0, PartitionId::new(2), "b", "2");
        assert_eq!(a.partition, PartitionId::new(2));
        assert_eq!(b.seq_no, a.seq_no + 1);
        assert_eq!(b.bucket, SIM_BUCKET);
    }

    #[tokio::test]
    async fn test_session_batches_and_closes() {
        let cluster = SimulatedCluster::new(1, 1);
        for i in 0..5 {
            cluster.insert_into(0, PartitionId::new(0), format!("k{i}"), "v");
        }

        let node = NodeIndex::new(0);
        let handle = cluster
            .create(node, PartitionId::new(0), &full_range(false))
            .await
            .unwrap();
        let first = cluster.continue_scan(node, &handle, 2, 1000).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(!first.complete);
        assert_eq!(first.items[0].value.as_deref(), Some(&b"v"[..]));

        let second = cluster.continue_scan(node, &handle, 10, 1000).await.unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.complete);
        assert_eq!(cluster.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_byte_limit_returns_at_least_one_item() {
        let cluster = SimulatedCluster::new(1, 1);
        cluster.insert_into(0, PartitionId::new(0), "big", vec![0u8; 64]);
        cluster.insert_into(0, PartitionId::new(0), "big2", vec![0u8; 64]);

        let node = NodeIndex::new(0);
        let handle = cluster
            .create(node, PartitionId::new(0), &full_range(false))
            .await
            .unwrap();
        let batch = cluster.continue_scan(node, &handle, 10, 8).await.unwrap();
        assert_eq!(batch.items.len(), 1);
    }

    #[tokio::test]
    async fn test_sampling_empty_partition_not_found() {
        let cluster = SimulatedCluster::new(1, 2);
        let scan = CreateScan {
            collection_id: 0,
            request: ScanRequest::Sampling { limit: 3, seed: 7 },
            snapshot: None,
            ids_only: true,
        };
        let err = cluster
            .create(NodeIndex::new(0), PartitionId::new(1), &scan)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::DocumentNotFound);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let cluster = SimulatedCluster::new(1, 1);
        cluster.insert_into(0, PartitionId::new(0), "a", "v");
        cluster.insert_into(0, PartitionId::new(0), "b", "v");
        cluster.fail_create(PartitionId::new(0), TransportErrorKind::Busy, 1);
        cluster.fail_continue(PartitionId::new(0), TransportErrorKind::NotMyVbucket, 1);

        let node = NodeIndex::new(0);
        let err = cluster
            .create(node, PartitionId::new(0), &full_range(true))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Busy);

        let handle = cluster
            .create(node, PartitionId::new(0), &full_range(true))
            .await
            .unwrap();
        cluster.continue_scan(node, &handle, 1, 100).await.unwrap();
        let err = cluster.continue_scan(node, &handle, 1, 100).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::NotMyVbucket);
        assert_eq!(cluster.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_named_collections() {
        let cluster = SimulatedCluster::new(1, 1);
        let id = cluster.add_collection("inventory", "airline");
        assert_eq!(cluster.collection_id("inventory", "airline").await.unwrap(), id);
        assert_eq!(cluster.collection_id("_default", "_default").await.unwrap(), 0);
        assert!(cluster.collection_id("inventory", "hotel").await.is_err());
    }
}
