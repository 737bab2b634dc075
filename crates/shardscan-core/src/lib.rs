//! # Shardscan Core
//!
//! Types and collaborator traits for scanning a partitioned key-value store.
//!
//! - **types**: partition and node ids, tasks, scan items, consistency tokens
//! - **scan**: scan descriptors (range, prefix, sampling) and per-partition requests
//! - **options**: scan options with defaults, loadable from TOML
//! - **topology**: topology snapshots and the placement map built from them
//! - **transport**: the create/continue/cancel transport and collection resolver
//! - **error**: transport error classification and caller-facing errors
//!
//! ## Quick Start
//!
//! ```rust
//! use shardscan_core::prelude::*;
//!
//! let scan = ScanType::from(PrefixScan::new("airline_"));
//! assert!(scan.validate().is_ok());
//!
//! let options = ScanOptions::new().with_concurrency(4).with_ids_only(true);
//! assert!(options.validate().is_ok());
//! ```

pub mod error;
pub mod options;
pub mod prelude;
pub mod scan;
pub mod topology;
pub mod transport;
pub mod types;
