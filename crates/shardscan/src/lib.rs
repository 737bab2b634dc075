//! # Shardscan
//!
//! Concurrent range, prefix and sampling scans over a partitioned
//! key-value store.
//!
//! - **engine**: validates a scan and starts it
//! - **balancer**: assigns partitions to workers, least busy node first
//! - **partition**: drives one partition's create/continue/cancel sessions
//! - **pool**: the worker tasks executing partition scans
//! - **stream**: the result stream and the scan's stop switch
//! - **sim**: an in-memory cluster for tests and benchmarks
//! - **bench**: throughput benchmarks
//!
//! ## Quick Start
//!
//! ```rust
//! use shardscan::prelude::*;
//! use shardscan::sim::SimulatedCluster;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ScanResult<()> {
//! let cluster = Arc::new(SimulatedCluster::new(2, 8));
//! cluster.upsert("airline_10", r#"{"name":"40-Mile Air"}"#);
//! cluster.upsert("hotel_1", r#"{"name":"Medway"}"#);
//!
//! let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));
//! let items = engine
//!     .scan(&cluster.default_keyspace(), PrefixScan::new("airline_"), ScanOptions::new())
//!     .await?
//!     .collect_all()
//!     .await?;
//! assert_eq!(items.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod bench;
pub mod engine;
pub mod partition;
pub mod pool;
pub mod sim;
pub mod stream;

/// Common imports.
pub mod prelude {
    pub use crate::engine::RangeScanEngine;
    pub use crate::stream::ScanResultStream;
    pub use shardscan_core::prelude::*;
}
