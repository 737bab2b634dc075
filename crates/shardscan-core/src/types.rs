//! Core types shared by the scan engine and its collaborators.
//!
//! This module defines partition and node identifiers, the unit of
//! assignable work, scan result items, session handles and the
//! consistency tokens a scan may be asked to wait for.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{ScanError, ScanResult};

/// Identifier of a partition (vbucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PartitionId(pub u16);

impl PartitionId {
    /// Create a new partition identifier.
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    /// Get the underlying partition number.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vb-{}", self.0)
    }
}

/// Index of a node in a topology snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

impl NodeIndex {
    /// Create a new node index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the underlying index.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// One unit of assignable work: a partition and the node that owns it.
///
/// Tasks are never mutated. A task that must be retried is re-inserted
/// into the queue of the node it was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionTask {
    /// The partition to scan.
    pub partition: PartitionId,
    /// The node that owns the partition.
    pub node: NodeIndex,
}

impl PartitionTask {
    /// Create a new task.
    pub fn new(partition: PartitionId, node: NodeIndex) -> Self {
        Self { partition, node }
    }
}

/// Scope and collection a scan reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keyspace {
    /// Bucket name, used to validate consistency tokens.
    pub bucket: String,
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
}

impl Keyspace {
    /// Name of the default scope and collection.
    pub const DEFAULT: &'static str = "_default";

    /// Create a keyspace for a named scope and collection.
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// The default collection of a bucket.
    pub fn default_collection(bucket: impl Into<String>) -> Self {
        Self::new(bucket, Self::DEFAULT, Self::DEFAULT)
    }

    /// Whether this is the bucket's default collection.
    pub fn is_default(&self) -> bool {
        self.scope == Self::DEFAULT && self.collection == Self::DEFAULT
    }
}

impl std::fmt::Display for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Opaque handle to a server-side scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanHandle(pub Uuid);

impl ScanHandle {
    /// Allocate a fresh random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScanHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document returned by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanItem {
    /// Document key.
    pub key: Vec<u8>,
    /// Compare-and-swap value of the document.
    pub cas: u64,
    /// Opaque document flags.
    pub flags: u32,
    /// Document body, absent for ids-only scans.
    pub value: Option<Vec<u8>>,
    /// Expiry in seconds since the Unix epoch, 0 if the document never expires.
    pub expiry: u32,
}

impl ScanItem {
    /// Create an ids-only item.
    pub fn id_only(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            cas: 0,
            flags: 0,
            value: None,
            expiry: 0,
        }
    }

    /// Create a full-document item.
    pub fn with_value(key: impl Into<Vec<u8>>, cas: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            cas,
            flags: 0,
            value: Some(value.into()),
            expiry: 0,
        }
    }

    /// The key as UTF-8 text, replacing invalid sequences.
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    /// Whether the item was produced by an ids-only scan.
    pub fn is_id_only(&self) -> bool {
        self.value.is_none()
    }

    /// Decode the document body as JSON.
    pub fn content_as<T: DeserializeOwned>(&self) -> ScanResult<T> {
        let value = self.value.as_deref().ok_or_else(|| {
            ScanError::InvalidArgument("cannot decode content of an ids-only scan item".into())
        })?;
        serde_json::from_slice(value).map_err(|e| ScanError::Decode(e.to_string()))
    }

    /// Expiry as a point in time, if the document expires.
    pub fn expiry_time(&self) -> Option<SystemTime> {
        if self.expiry == 0 {
            return None;
        }
        Some(UNIX_EPOCH + Duration::from_secs(u64::from(self.expiry)))
    }
}

/// Consistency precondition a partition scan must satisfy before returning data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRequirement {
    /// Partition uuid the sequence number belongs to.
    pub partition_uuid: u64,
    /// Minimum sequence number that must be visible.
    pub seq_no: u64,
}

/// Token produced by a mutation, identifying a point in a partition's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationToken {
    /// Bucket the mutation was written to.
    pub bucket: String,
    /// Partition the mutation was written to.
    pub partition: PartitionId,
    /// Partition uuid at the time of the mutation.
    pub partition_uuid: u64,
    /// Sequence number of the mutation.
    pub seq_no: u64,
}

/// A set of mutation tokens a scan must be consistent with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationState {
    tokens: Vec<MutationToken>,
}

impl MutationState {
    /// Create an empty mutation state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token.
    pub fn add(&mut self, token: MutationToken) {
        self.tokens.push(token);
    }

    /// Add a token, builder style.
    pub fn with_token(mut self, token: MutationToken) -> Self {
        self.add(token);
        self
    }

    /// The tokens in insertion order.
    pub fn tokens(&self) -> &[MutationToken] {
        &self.tokens
    }

    /// Whether no tokens were added.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Reduce the tokens to one requirement per partition.
    ///
    /// When several tokens name the same partition the highest sequence
    /// number wins. Tokens for another bucket are rejected.
    pub fn snapshot_requirements(
        &self,
        bucket: &str,
    ) -> ScanResult<HashMap<PartitionId, SnapshotRequirement>> {
        let mut requirements: HashMap<PartitionId, SnapshotRequirement> = HashMap::new();
        for token in &self.tokens {
            if token.bucket != bucket {
                return Err(ScanError::InvalidArgument(format!(
                    "mutation token for bucket {} cannot be used to scan bucket {}",
                    token.bucket, bucket
                )));
            }
            let candidate = SnapshotRequirement {
                partition_uuid: token.partition_uuid,
                seq_no: token.seq_no,
            };
            requirements
                .entry(token.partition)
                .and_modify(|existing| {
                    if candidate.seq_no > existing.seq_no {
                        *existing = candidate;
                    }
                })
                .or_insert(candidate);
        }
        Ok(requirements)
    }
}
