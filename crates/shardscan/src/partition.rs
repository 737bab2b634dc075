//! Scanning a single partition.
//!
//! A `PartitionScanner` drives one partition through the session
//! sub-protocol: create a session, continue it until the node reports the
//! partition exhausted, and cancel it if the scan stops early. When a node
//! loses the session mid-stream the scanner re-creates it just past the
//! last key it delivered.

use crate::stream::{ResultSink, ScanControl};
use shardscan_core::error::{ScanError, TransportError, TransportErrorKind};
use shardscan_core::scan::{CreateScan, ScanRequest};
use shardscan_core::transport::ScanTransport;
use shardscan_core::types::{Keyspace, PartitionId, PartitionTask, ScanHandle, SnapshotRequirement};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything shared by the partition scanners of one scan.
pub struct ScanContext {
    /// Transport used for every session.
    pub transport: Arc<dyn ScanTransport>,
    /// Collection being scanned, for error reporting.
    pub keyspace: Keyspace,
    /// Numeric id of the collection.
    pub collection_id: u32,
    /// Per-partition request before any resume.
    pub request: ScanRequest,
    /// Return keys without document bodies.
    pub ids_only: bool,
    /// Items requested per continue.
    pub batch_item_limit: u32,
    /// Bytes requested per continue.
    pub batch_byte_limit: u32,
    /// Consistency requirements keyed by partition.
    pub snapshots: HashMap<PartitionId, SnapshotRequirement>,
}

impl ScanContext {
    /// Whether this is a sampling scan.
    pub fn is_sampling(&self) -> bool {
        matches!(self.request, ScanRequest::Sampling { .. })
    }

    fn create_request(&self, partition: PartitionId, last_key: Option<&[u8]>) -> CreateScan {
        let request = match last_key {
            Some(key) => self.request.resume_after(key),
            None => self.request.clone(),
        };
        CreateScan {
            collection_id: self.collection_id,
            request,
            snapshot: self.snapshots.get(&partition).copied(),
            ids_only: self.ids_only,
        }
    }

    fn fatal(&self, partition: PartitionId, err: TransportError) -> ScanError {
        ScanError::from_transport(
            partition,
            &self.keyspace.scope,
            &self.keyspace.collection,
            err,
        )
    }
}

impl std::fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanContext")
            .field("keyspace", &self.keyspace)
            .field("collection_id", &self.collection_id)
            .field("request", &self.request)
            .field("ids_only", &self.ids_only)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of one partition scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No session open yet.
    Created,
    /// A session is open and batches are being fetched.
    Streaming,
    /// The node reported the partition exhausted.
    Complete,
    /// The scan stopped before the partition was exhausted.
    Cancelled,
    /// The partition failed.
    Failed,
}

/// How a partition scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Every item in the partition was delivered.
    Complete,
    /// The partition was ignored after a non-fatal error.
    Skipped,
    /// The scan stopped; the worker should exit.
    Cancelled,
    /// The node was too busy; try the partition again later.
    Retry(TransportError),
    /// The partition failed and the whole scan must fail.
    Fatal(ScanError),
}

enum SessionEnd {
    Done(PartitionOutcome),
    Resume(TransportError),
}

/// Drives one partition from create to completion.
pub struct PartitionScanner<'a> {
    ctx: &'a ScanContext,
    task: PartitionTask,
    sink: &'a ResultSink,
    control: &'a ScanControl,
    last_key_seen: Option<Vec<u8>>,
    state: ScanState,
    sessions: u32,
}

impl<'a> PartitionScanner<'a> {
    pub fn new(
        ctx: &'a ScanContext,
        task: PartitionTask,
        sink: &'a ResultSink,
        control: &'a ScanControl,
    ) -> Self {
        Self {
            ctx,
            task,
            sink,
            control,
            last_key_seen: None,
            state: ScanState::Created,
            sessions: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Last key handed to the caller from this partition.
    pub fn last_key_seen(&self) -> Option<&[u8]> {
        self.last_key_seen.as_deref()
    }

    /// Scan the partition until it is exhausted, skipped, or the scan stops.
    pub async fn run(&mut self) -> PartitionOutcome {
        loop {
            if self.control.is_stopped() {
                return self.end(PartitionOutcome::Cancelled);
            }

            let create = self
                .ctx
                .create_request(self.task.partition, self.last_key_seen.as_deref());
            let handle = match self
                .ctx
                .transport
                .create(self.task.node, self.task.partition, &create)
                .await
            {
                Ok(handle) => handle,
                Err(err) => {
                    let outcome = self.classify_create(err);
                    return self.end(outcome);
                }
            };
            self.sessions += 1;
            self.state = ScanState::Streaming;
            debug!(
                partition = %self.task.partition,
                node = %self.task.node,
                handle = %handle,
                resumed = self.last_key_seen.is_some(),
                "scan session created"
            );

            match self.stream(&handle).await {
                SessionEnd::Done(outcome) => return self.end(outcome),
                SessionEnd::Resume(err) => {
                    debug!(
                        partition = %self.task.partition,
                        error = %err,
                        "session lost, resuming after last key"
                    );
                    self.state = ScanState::Created;
                }
            }
        }
    }

    async fn stream(&mut self, handle: &ScanHandle) -> SessionEnd {
        loop {
            if self.control.is_stopped() {
                self.cancel_session(handle).await;
                return SessionEnd::Done(PartitionOutcome::Cancelled);
            }

            let batch = match self
                .ctx
                .transport
                .continue_scan(
                    self.task.node,
                    handle,
                    self.ctx.batch_item_limit,
                    self.ctx.batch_byte_limit,
                )
                .await
            {
                Ok(batch) => batch,
                Err(err) if err.is_resumable() => return SessionEnd::Resume(err),
                Err(err) => return SessionEnd::Done(self.classify_continue(err)),
            };

            let complete = batch.complete;
            if let Some(last) = batch.items.last() {
                self.last_key_seen = Some(last.key.clone());
            }
            for item in batch.items {
                if !self.sink.deliver(item).await {
                    if !complete {
                        self.cancel_session(handle).await;
                    }
                    return SessionEnd::Done(PartitionOutcome::Cancelled);
                }
            }
            if complete {
                return SessionEnd::Done(PartitionOutcome::Complete);
            }
        }
    }

    fn classify_create(&self, err: TransportError) -> PartitionOutcome {
        let sampling = self.ctx.is_sampling();
        if sampling && err.kind == TransportErrorKind::DocumentNotFound {
            debug!(partition = %self.task.partition, "no documents in partition, skipping");
            return PartitionOutcome::Skipped;
        }
        if err.is_retryable() {
            return PartitionOutcome::Retry(err);
        }
        if sampling {
            debug!(partition = %self.task.partition, error = %err, "ignoring partition");
            return PartitionOutcome::Skipped;
        }
        PartitionOutcome::Fatal(self.ctx.fatal(self.task.partition, err))
    }

    fn classify_continue(&self, err: TransportError) -> PartitionOutcome {
        match err.kind {
            TransportErrorKind::DocumentNotFound
            | TransportErrorKind::AuthenticationFailure
            | TransportErrorKind::CollectionNotFound
                if self.ctx.is_sampling() =>
            {
                debug!(partition = %self.task.partition, error = %err, "ignoring partition");
                PartitionOutcome::Skipped
            }
            TransportErrorKind::ScanCancelled => PartitionOutcome::Fatal(ScanError::RequestCanceled),
            _ => PartitionOutcome::Fatal(self.ctx.fatal(self.task.partition, err)),
        }
    }

    async fn cancel_session(&self, handle: &ScanHandle) {
        if let Err(err) = self.ctx.transport.cancel(self.task.node, handle).await {
            debug!(partition = %self.task.partition, handle = %handle, error = %err, "cancel failed");
        }
    }

    fn end(&mut self, outcome: PartitionOutcome) -> PartitionOutcome {
        self.state = match &outcome {
            PartitionOutcome::Complete | PartitionOutcome::Skipped => ScanState::Complete,
            PartitionOutcome::Cancelled | PartitionOutcome::Retry(_) => ScanState::Cancelled,
            PartitionOutcome::Fatal(err) => {
                warn!(partition = %self.task.partition, error = %err, "partition scan failed");
                ScanState::Failed
            }
        };
        if self.sessions > 1 {
            debug!(partition = %self.task.partition, sessions = self.sessions, "partition used multiple sessions");
        }
        outcome
    }
}
