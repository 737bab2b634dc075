//! Scan options.
//!
//! Options can be built in code with the `with_*` methods or loaded from a
//! TOML document; any field missing from the document takes its default.
//!
//! ```toml
//! ids_only = true
//! batch_item_limit = 200
//! concurrency = 4
//! timeout_ms = 30000
//! ```

use crate::error::{ScanError, ScanResult};
use crate::types::MutationState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of items requested per `continue`.
pub const DEFAULT_BATCH_ITEM_LIMIT: u32 = 50;

/// Default number of bytes requested per `continue`.
pub const DEFAULT_BATCH_BYTE_LIMIT: u32 = 15_000;

/// Default number of partitions scanned concurrently.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default overall scan timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 75_000;

/// Options controlling a single scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Return keys only, without document bodies.
    #[serde(default)]
    pub ids_only: bool,
    /// Maximum items per batch.
    #[serde(default = "default_batch_item_limit")]
    pub batch_item_limit: u32,
    /// Maximum bytes per batch.
    #[serde(default = "default_batch_byte_limit")]
    pub batch_byte_limit: u32,
    /// Number of partitions scanned at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Overall deadline for the scan, in milliseconds from its start.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Mutations the scan must observe.
    #[serde(skip)]
    pub consistent_with: Option<MutationState>,
}

fn default_batch_item_limit() -> u32 {
    DEFAULT_BATCH_ITEM_LIMIT
}

fn default_batch_byte_limit() -> u32 {
    DEFAULT_BATCH_BYTE_LIMIT
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ids_only: false,
            batch_item_limit: DEFAULT_BATCH_ITEM_LIMIT,
            batch_byte_limit: DEFAULT_BATCH_BYTE_LIMIT,
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            consistent_with: None,
        }
    }
}

impl ScanOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a TOML document.
    pub fn from_toml_str(text: &str) -> ScanResult<Self> {
        let options: ScanOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ScanResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ScanError::InvalidArgument(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Return ids only.
    pub fn with_ids_only(mut self, ids_only: bool) -> Self {
        self.ids_only = ids_only;
        self
    }

    /// Set the per-batch item limit.
    pub fn with_batch_item_limit(mut self, limit: u32) -> Self {
        self.batch_item_limit = limit;
        self
    }

    /// Set the per-batch byte limit.
    pub fn with_batch_byte_limit(mut self, limit: u32) -> Self {
        self.batch_byte_limit = limit;
        self
    }

    /// Set the number of concurrent partition scans.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Require the scan to observe the given mutations.
    pub fn with_consistent_with(mut self, state: MutationState) -> Self {
        self.consistent_with = Some(state);
        self
    }

    /// The overall timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject option values that can never produce a working scan.
    pub fn validate(&self) -> ScanResult<()> {
        if self.concurrency == 0 {
            return Err(ScanError::InvalidArgument(
                "concurrency must be greater than 0".into(),
            ));
        }
        if self.batch_item_limit == 0 {
            return Err(ScanError::InvalidArgument(
                "batch item limit must be greater than 0".into(),
            ));
        }
        if self.batch_byte_limit == 0 {
            return Err(ScanError::InvalidArgument(
                "batch byte limit must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
