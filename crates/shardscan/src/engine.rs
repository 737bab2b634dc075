//! Scan engine.
//!
//! The engine turns a scan request into a running scan:
//! - Validates the scan and its options
//! - Takes a topology snapshot and builds the placement map
//! - Resolves the collection id and consistency requirements
//! - Starts the worker pool and the deadline timer
//! - Waits for the first result before handing back the stream
//!
//! # Example
//!
//! ```rust,ignore
//! use shardscan::prelude::*;
//!
//! let engine = RangeScanEngine::new(topology, transport, collections);
//! let mut stream = engine
//!     .scan(&keyspace, PrefixScan::new("airline_"), ScanOptions::new().with_concurrency(4))
//!     .await?;
//!
//! while let Some(item) = stream.next().await {
//!     println!("{}", item?.key_str());
//! }
//! ```

use crate::balancer::LoadBalancer;
use crate::partition::ScanContext;
use crate::pool::WorkerPool;
use crate::stream::{ResultSink, ScanControl, ScanResultStream, StopReason};
use shardscan_core::error::{ScanError, ScanResult};
use shardscan_core::options::ScanOptions;
use shardscan_core::scan::ScanType;
use shardscan_core::topology::{PlacementMap, TopologyProvider};
use shardscan_core::transport::{CollectionIdResolver, ScanTransport};
use shardscan_core::types::Keyspace;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Collection id of the default scope and collection.
pub const DEFAULT_COLLECTION_ID: u32 = 0;

/// Runs range, prefix and sampling scans over a partitioned collection.
///
/// The engine holds only its collaborators. Every call to `scan` builds
/// its own balancer, workers and result queue, so scans are independent.
#[derive(Clone)]
pub struct RangeScanEngine {
    topology: Arc<dyn TopologyProvider>,
    transport: Arc<dyn ScanTransport>,
    collections: Arc<dyn CollectionIdResolver>,
}

impl RangeScanEngine {
    /// Create an engine over the given collaborators.
    pub fn new(
        topology: Arc<dyn TopologyProvider>,
        transport: Arc<dyn ScanTransport>,
        collections: Arc<dyn CollectionIdResolver>,
    ) -> Self {
        Self {
            topology,
            transport,
            collections,
        }
    }

    /// Create an engine over a single value implementing every collaborator.
    pub fn from_cluster<C>(cluster: Arc<C>) -> Self
    where
        C: TopologyProvider + ScanTransport + CollectionIdResolver + 'static,
    {
        Self::new(cluster.clone(), cluster.clone(), cluster)
    }

    /// Start a scan of `keyspace`.
    ///
    /// Returns once the first item is available or the scan has finished
    /// without producing one. Errors that occur before any item is produced
    /// are returned here; later errors are reported by the stream.
    pub async fn scan(
        &self,
        keyspace: &Keyspace,
        scan_type: impl Into<ScanType>,
        options: ScanOptions,
    ) -> ScanResult<ScanResultStream> {
        let scan_type = scan_type.into();
        scan_type.validate()?;
        options.validate()?;

        let deadline = Instant::now() + options.timeout();

        let snapshot = within(deadline, self.topology.snapshot()).await?;
        let placement = PlacementMap::from_snapshot(snapshot.as_ref())?;

        let collection_id = if keyspace.is_default() {
            DEFAULT_COLLECTION_ID
        } else {
            within(
                deadline,
                self.collections
                    .collection_id(&keyspace.scope, &keyspace.collection),
            )
            .await?
        };

        let snapshots = match &options.consistent_with {
            Some(state) => state.snapshot_requirements(&keyspace.bucket)?,
            None => HashMap::new(),
        };

        let (request, seed) = scan_type.resolve(rand::random());
        let item_cap = match &scan_type {
            ScanType::Sampling(sampling) => Some(sampling.limit),
            _ => None,
        };

        info!(
            keyspace = %keyspace,
            partitions = placement.num_partitions(),
            nodes = placement.num_nodes(),
            concurrency = options.concurrency,
            sampling = scan_type.is_sampling(),
            seed,
            "starting scan"
        );

        let control = Arc::new(ScanControl::with_item_cap(item_cap));
        let (tx, rx) = mpsc::channel(options.batch_item_limit as usize);
        let ctx = Arc::new(ScanContext {
            transport: Arc::clone(&self.transport),
            keyspace: keyspace.clone(),
            collection_id,
            request,
            ids_only: options.ids_only,
            batch_item_limit: options.batch_item_limit,
            batch_byte_limit: options.batch_byte_limit,
            snapshots,
        });
        let balancer = Arc::new(LoadBalancer::new(&placement, seed, options.concurrency));

        WorkerPool::new(balancer, ctx, Arc::clone(&control), options.concurrency)
            .spawn(ResultSink::new(tx, Arc::clone(&control)));
        spawn_deadline(Arc::clone(&control), deadline);

        let mut stream = ScanResultStream::new(rx, control);
        stream.peek_first().await?;
        Ok(stream)
    }
}

impl std::fmt::Debug for RangeScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeScanEngine").finish_non_exhaustive()
    }
}

/// Await `fut`, failing with `Timeout` if `deadline` passes first.
async fn within<T, F>(deadline: Instant, fut: F) -> ScanResult<T>
where
    F: Future<Output = ScanResult<T>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| ScanError::Timeout)?
}

/// Stop the scan with `TimedOut` at `deadline` unless it stops first.
fn spawn_deadline(control: Arc<ScanControl>, deadline: Instant) {
    tokio::spawn(async move {
        tokio::select! {
            _ = control.token().cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                if control.stop(StopReason::TimedOut) {
                    debug!("scan deadline reached");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCluster;
    use shardscan_core::scan::{RangeScan, SamplingScan};
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_options_rejected_before_topology() {
        let cluster = Arc::new(SimulatedCluster::new(2, 4));
        let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

        let err = engine
            .scan(
                &Keyspace::default_collection("travel"),
                RangeScan::new(),
                ScanOptions::new().with_concurrency(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidArgument(_)));
        assert_eq!(cluster.snapshot_requests(), 0);
    }

    #[tokio::test]
    async fn test_sampling_limit_zero_makes_no_calls() {
        let cluster = Arc::new(SimulatedCluster::new(2, 4));
        let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

        let err = engine
            .scan(
                &Keyspace::default_collection("travel"),
                SamplingScan::new(0),
                ScanOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidArgument(_)));
        assert_eq!(cluster.snapshot_requests(), 0);
        assert!(cluster.create_log().is_empty());
    }

    #[tokio::test]
    async fn test_slow_topology_times_out() {
        let cluster = Arc::new(SimulatedCluster::new(1, 2));
        cluster.set_snapshot_delay(Duration::from_millis(200));
        let engine = RangeScanEngine::from_cluster(cluster);

        let err = engine
            .scan(
                &Keyspace::default_collection("travel"),
                RangeScan::new(),
                ScanOptions::new().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ScanError::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_collection_fails() {
        let cluster = Arc::new(SimulatedCluster::new(1, 2));
        let engine = RangeScanEngine::from_cluster(cluster);

        let err = engine
            .scan(
                &Keyspace::new("travel", "inventory", "missing"),
                RangeScan::new(),
                ScanOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::CollectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_collection_yields_nothing() {
        let cluster = Arc::new(SimulatedCluster::new(2, 8));
        let engine = RangeScanEngine::from_cluster(cluster);

        let mut stream = engine
            .scan(
                &Keyspace::default_collection("travel"),
                RangeScan::new(),
                ScanOptions::new().with_concurrency(3),
            )
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
        assert!(stream.err().is_none());
    }
}
