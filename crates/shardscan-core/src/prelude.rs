//! Shardscan Core Prelude: convenient imports for common usage.
//!
//! ```rust
//! use shardscan_core::prelude::*;
//! ```

pub use crate::types::{
    Keyspace, MutationState, MutationToken, NodeIndex, PartitionId, PartitionTask, ScanHandle,
    ScanItem, SnapshotRequirement,
};

pub use crate::scan::{
    CreateScan, PrefixScan, RangeScan, SamplingScan, ScanRequest, ScanTerm, ScanType,
};

pub use crate::options::ScanOptions;

pub use crate::topology::{PlacementMap, TopologyProvider, TopologySnapshot};

pub use crate::transport::{CollectionIdResolver, ScanBatch, ScanTransport};

pub use crate::error::{ScanError, ScanResult, TransportError, TransportErrorKind};
