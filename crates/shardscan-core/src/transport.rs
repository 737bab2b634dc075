//! Collaborator traits for talking to nodes.
//!
//! The engine never encodes requests itself. It drives the
//! create → continue* → cancel sub-protocol through `ScanTransport` and
//! resolves collection names through `CollectionIdResolver`.

use crate::error::{ScanResult, TransportError};
use crate::scan::CreateScan;
use crate::types::{NodeIndex, PartitionId, ScanHandle, ScanItem};
use async_trait::async_trait;

/// One batch of results from a `continue` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanBatch {
    /// Items in partition order.
    pub items: Vec<ScanItem>,
    /// Whether the partition is exhausted and the session closed.
    pub complete: bool,
}

impl ScanBatch {
    /// A batch with more results to follow.
    pub fn more(items: Vec<ScanItem>) -> Self {
        Self {
            items,
            complete: false,
        }
    }

    /// The final batch of a partition.
    pub fn last(items: Vec<ScanItem>) -> Self {
        Self {
            items,
            complete: true,
        }
    }
}

/// Wire-level access to scan sessions on individual nodes.
#[async_trait]
pub trait ScanTransport: Send + Sync {
    /// Open a scan session for `partition` on `node`.
    async fn create(
        &self,
        node: NodeIndex,
        partition: PartitionId,
        scan: &CreateScan,
    ) -> Result<ScanHandle, TransportError>;

    /// Fetch the next batch of a session.
    async fn continue_scan(
        &self,
        node: NodeIndex,
        handle: &ScanHandle,
        item_limit: u32,
        byte_limit: u32,
    ) -> Result<ScanBatch, TransportError>;

    /// Release a session before it is exhausted.
    async fn cancel(&self, node: NodeIndex, handle: &ScanHandle) -> Result<(), TransportError>;
}

/// Resolves a scope and collection name to the numeric id used on the wire.
#[async_trait]
pub trait CollectionIdResolver: Send + Sync {
    /// Look up the collection id.
    async fn collection_id(&self, scope: &str, collection: &str) -> ScanResult<u32>;
}
