//! Scan descriptors.
//!
//! A `ScanType` is what the caller asks for. Before dispatch it is resolved
//! into a `ScanRequest`, the form sent to each partition on `create`: range
//! and prefix scans both become explicit key ranges, and sampling scans get a
//! concrete seed.

use crate::error::{ScanError, ScanResult};
use crate::types::SnapshotRequirement;
use serde::{Deserialize, Serialize};

/// Smallest possible key, used when a range has no lower bound.
pub const MIN_KEY: &[u8] = &[0x00];

/// Largest possible key, used when a range has no upper bound.
pub const MAX_KEY: &[u8] = &[0xff];

/// One end of a key range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanTerm {
    /// The key the range starts or ends at.
    pub term: Vec<u8>,
    /// Whether `term` itself is excluded from the range.
    pub exclusive: bool,
}

impl ScanTerm {
    /// A bound that includes `term`.
    pub fn inclusive(term: impl Into<Vec<u8>>) -> Self {
        Self {
            term: term.into(),
            exclusive: false,
        }
    }

    /// A bound that excludes `term`.
    pub fn exclusive(term: impl Into<Vec<u8>>) -> Self {
        Self {
            term: term.into(),
            exclusive: true,
        }
    }

    /// The lowest key in the keyspace.
    pub fn minimum() -> Self {
        Self::inclusive(MIN_KEY)
    }

    /// The highest key in the keyspace.
    pub fn maximum() -> Self {
        Self::inclusive(MAX_KEY)
    }

    /// Whether `key` lies on the permitted side of this term when used as a start bound.
    pub fn admits_from(&self, key: &[u8]) -> bool {
        if self.exclusive {
            key > self.term.as_slice()
        } else {
            key >= self.term.as_slice()
        }
    }

    /// Whether `key` lies on the permitted side of this term when used as an end bound.
    pub fn admits_to(&self, key: &[u8]) -> bool {
        if self.exclusive {
            key < self.term.as_slice()
        } else {
            key <= self.term.as_slice()
        }
    }
}

/// Scan of a contiguous key range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeScan {
    /// Lower bound; the minimum key when absent.
    pub from: Option<ScanTerm>,
    /// Upper bound; the maximum key when absent.
    pub to: Option<ScanTerm>,
}

impl RangeScan {
    /// A range scan over the whole keyspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lower bound.
    pub fn from(mut self, term: ScanTerm) -> Self {
        self.from = Some(term);
        self
    }

    /// Set the upper bound.
    pub fn to(mut self, term: ScanTerm) -> Self {
        self.to = Some(term);
        self
    }
}

/// Scan of every key starting with a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixScan {
    /// Keys returned all start with this prefix.
    pub prefix: Vec<u8>,
}

impl PrefixScan {
    /// Create a prefix scan.
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

/// Scan of a random sample of documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingScan {
    /// Maximum number of documents returned. Must be positive.
    pub limit: u64,
    /// Seed for the sample; generated when absent.
    pub seed: Option<u64>,
}

impl SamplingScan {
    /// Create a sampling scan with a generated seed.
    pub fn new(limit: u64) -> Self {
        Self { limit, seed: None }
    }

    /// Fix the seed so the sample is reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// What a scan reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    /// A contiguous key range.
    Range(RangeScan),
    /// Every key with a given prefix.
    Prefix(PrefixScan),
    /// A random sample.
    Sampling(SamplingScan),
}

impl ScanType {
    /// Whether this is a sampling scan.
    pub fn is_sampling(&self) -> bool {
        matches!(self, ScanType::Sampling(_))
    }

    /// Check the descriptor before any network call is made.
    pub fn validate(&self) -> ScanResult<()> {
        match self {
            ScanType::Range(range) => {
                for term in [&range.from, &range.to].into_iter().flatten() {
                    if term.term.is_empty() {
                        return Err(ScanError::InvalidArgument(
                            "range scan terms must not be empty".into(),
                        ));
                    }
                }
                Ok(())
            }
            ScanType::Prefix(prefix) => {
                if prefix.prefix.is_empty() {
                    return Err(ScanError::InvalidArgument(
                        "prefix scan prefix must not be empty".into(),
                    ));
                }
                Ok(())
            }
            ScanType::Sampling(sampling) => {
                if sampling.limit == 0 {
                    return Err(ScanError::InvalidArgument(
                        "sampling scan limit must be greater than 0".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Resolve into the request sent to partitions, generating a seed if needed.
    ///
    /// Returns the request and the seed used to order partitions.
    pub fn resolve(&self, generated_seed: u64) -> (ScanRequest, u64) {
        match self {
            ScanType::Range(range) => (
                ScanRequest::Range {
                    start: range.from.clone().unwrap_or_else(ScanTerm::minimum),
                    end: range.to.clone().unwrap_or_else(ScanTerm::maximum),
                },
                generated_seed,
            ),
            ScanType::Prefix(prefix) => {
                let mut end = prefix.prefix.clone();
                end.extend_from_slice(MAX_KEY);
                (
                    ScanRequest::Range {
                        start: ScanTerm::inclusive(prefix.prefix.clone()),
                        end: ScanTerm::inclusive(end),
                    },
                    generated_seed,
                )
            }
            ScanType::Sampling(sampling) => {
                let seed = sampling.seed.unwrap_or(generated_seed);
                (
                    ScanRequest::Sampling {
                        limit: sampling.limit,
                        seed,
                    },
                    seed,
                )
            }
        }
    }
}

impl From<RangeScan> for ScanType {
    fn from(scan: RangeScan) -> Self {
        ScanType::Range(scan)
    }
}

impl From<PrefixScan> for ScanType {
    fn from(scan: PrefixScan) -> Self {
        ScanType::Prefix(scan)
    }
}

impl From<SamplingScan> for ScanType {
    fn from(scan: SamplingScan) -> Self {
        ScanType::Sampling(scan)
    }
}

/// The per-partition form of a scan, as sent on `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanRequest {
    /// Keys between `start` and `end`.
    Range { start: ScanTerm, end: ScanTerm },
    /// Up to `limit` random keys chosen with `seed`.
    Sampling { limit: u64, seed: u64 },
}

impl ScanRequest {
    /// The request used to re-create a session after `last_key` was delivered.
    ///
    /// Range requests restart just past `last_key`. Sampling requests cannot
    /// be positioned by key and are re-issued unchanged.
    pub fn resume_after(&self, last_key: &[u8]) -> ScanRequest {
        match self {
            ScanRequest::Range { end, .. } => ScanRequest::Range {
                start: ScanTerm::exclusive(last_key.to_vec()),
                end: end.clone(),
            },
            ScanRequest::Sampling { .. } => self.clone(),
        }
    }

    /// Whether `key` falls inside a range request. Sampling requests admit every key.
    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            ScanRequest::Range { start, end } => start.admits_from(key) && end.admits_to(key),
            ScanRequest::Sampling { .. } => true,
        }
    }
}

/// Everything a transport needs to open a session on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateScan {
    /// Numeric id of the collection being scanned.
    pub collection_id: u32,
    /// Range or sampling parameters.
    pub request: ScanRequest,
    /// Consistency the partition must reach before returning data.
    pub snapshot: Option<SnapshotRequirement>,
    /// Return keys without document bodies.
    pub ids_only: bool,
}
