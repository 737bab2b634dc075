//! Result stream handed to scan callers.
//!
//! Workers push items through a `ResultSink`; the caller pulls them from a
//! `ScanResultStream`. Both sides share a `ScanControl`: a set-once stop
//! switch recording why the scan stopped, backed by a cancellation token
//! that blocked sends and receives select on.

use shardscan_core::error::{ScanError, ScanResult};
use shardscan_core::types::ScanItem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a scan stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// All partitions finished, or a sampling scan reached its limit.
    Completed,
    /// The caller closed or dropped the stream.
    Closed,
    /// The scan deadline passed.
    TimedOut,
    /// A partition failed fatally.
    Failed(ScanError),
}

impl StopReason {
    /// Whether already-queued items should be withheld from the caller.
    pub fn is_abort(&self) -> bool {
        !matches!(self, StopReason::Completed)
    }
}

/// Shared stop switch and delivery counters for one scan.
#[derive(Debug)]
pub struct ScanControl {
    token: CancellationToken,
    reason: OnceLock<StopReason>,
    delivered: AtomicU64,
    item_cap: Option<u64>,
}

impl ScanControl {
    /// Create a control with no cap on delivered items.
    pub fn new() -> Self {
        Self::with_item_cap(None)
    }

    /// Create a control that completes the scan after `cap` items.
    pub fn with_item_cap(item_cap: Option<u64>) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
            delivered: AtomicU64::new(0),
            item_cap,
        }
    }

    /// Stop the scan. Only the first call has any effect; returns whether it was this one.
    pub fn stop(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    /// Stop the scan with a fatal error. Later errors are discarded.
    pub fn fail(&self, err: ScanError) -> bool {
        self.stop(StopReason::Failed(err))
    }

    /// Whether the scan has stopped for any reason.
    pub fn is_stopped(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Whether the scan stopped for a reason other than completion.
    pub fn is_aborted(&self) -> bool {
        self.reason.get().is_some_and(StopReason::is_abort)
    }

    /// The recorded stop reason.
    pub fn reason(&self) -> Option<&StopReason> {
        self.reason.get()
    }

    /// The error to surface to the caller, if any.
    pub fn error(&self) -> Option<ScanError> {
        match self.reason.get()? {
            StopReason::Failed(err) => Some(err.clone()),
            StopReason::TimedOut => Some(ScanError::Timeout),
            StopReason::Completed | StopReason::Closed => None,
        }
    }

    /// Token cancelled when the scan stops.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the scan is aborted. Never resolves after normal completion.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
        if !self.is_aborted() {
            std::future::pending::<()>().await;
        }
    }

    /// Number of items accepted for delivery so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}

impl Default for ScanControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the result queue. Cloned once per worker.
#[derive(Debug, Clone)]
pub struct ResultSink {
    tx: mpsc::Sender<ScanItem>,
    control: Arc<ScanControl>,
}

impl ResultSink {
    /// Wrap the sending half of the result queue.
    pub fn new(tx: mpsc::Sender<ScanItem>, control: Arc<ScanControl>) -> Self {
        Self { tx, control }
    }

    /// Queue an item for the caller, waiting while the queue is full.
    ///
    /// Returns `false` when the item was not accepted because the scan
    /// stopped, and the producer should stop scanning.
    pub async fn deliver(&self, item: ScanItem) -> bool {
        if self.control.is_stopped() {
            return false;
        }
        let seq = self.control.delivered.fetch_add(1, Ordering::AcqRel);
        if let Some(cap) = self.control.item_cap {
            if seq >= cap {
                self.control.stop(StopReason::Completed);
                return false;
            }
        }

        let sent = tokio::select! {
            biased;
            _ = self.control.aborted() => false,
            res = self.tx.send(item) => res.is_ok(),
        };

        if let Some(cap) = self.control.item_cap {
            if seq + 1 == cap {
                debug!(limit = cap, "sample limit reached");
                self.control.stop(StopReason::Completed);
            }
        }
        sent
    }
}

/// The caller's view of a running scan.
///
/// Items arrive in no particular order across partitions. After the last
/// item, a fatal error (if any) is returned once, followed by `None`.
#[derive(Debug)]
pub struct ScanResultStream {
    rx: mpsc::Receiver<ScanItem>,
    peeked: Option<ScanItem>,
    control: Arc<ScanControl>,
    error_reported: bool,
    closed: bool,
    received: u64,
}

impl ScanResultStream {
    /// Wrap the receiving half of the result queue.
    pub fn new(rx: mpsc::Receiver<ScanItem>, control: Arc<ScanControl>) -> Self {
        Self {
            rx,
            peeked: None,
            control,
            error_reported: false,
            closed: false,
            received: 0,
        }
    }

    /// Wait for the first item, an empty close, or an early failure.
    ///
    /// The first item is kept in the peek slot and returned by the first
    /// `next`. A failure before any item is returned here instead.
    pub async fn peek_first(&mut self) -> ScanResult<()> {
        let first = tokio::select! {
            biased;
            item = self.rx.recv() => item,
            _ = self.control.aborted() => None,
        };
        match first {
            Some(item) => {
                self.peeked = Some(item);
                Ok(())
            }
            None => match self.control.error() {
                Some(err) => {
                    self.error_reported = true;
                    Err(err)
                }
                None => Ok(()),
            },
        }
    }

    /// Next item, the scan's error, or `None` when the scan is over.
    pub async fn next(&mut self) -> Option<ScanResult<ScanItem>> {
        if self.closed {
            return None;
        }
        if self.control.is_aborted() {
            self.peeked = None;
            return self.finish();
        }
        if let Some(item) = self.peeked.take() {
            self.received += 1;
            return Some(Ok(item));
        }

        let item = tokio::select! {
            biased;
            _ = self.control.aborted() => None,
            item = self.rx.recv() => item,
        };
        match item {
            Some(item) => {
                self.received += 1;
                Some(Ok(item))
            }
            None => self.finish(),
        }
    }

    fn finish(&mut self) -> Option<ScanResult<ScanItem>> {
        if self.error_reported {
            return None;
        }
        let err = self.control.error()?;
        self.error_reported = true;
        Some(Err(err))
    }

    /// Close the stream and stop the scan. Safe to call repeatedly and
    /// while workers are delivering.
    ///
    /// Once closed, `next` returns `None` even if items are still queued
    /// or the workers already finished. Returns whether this call closed it.
    pub fn close(&mut self) -> bool {
        let first = !self.closed;
        self.closed = true;
        self.peeked = None;
        self.rx.close();
        self.control.stop(StopReason::Closed);
        if first {
            debug!(received = self.received, "scan closed by caller");
        }
        first
    }

    /// The scan's fatal error, if it failed.
    pub fn err(&self) -> Option<ScanError> {
        self.control.error()
    }

    /// Whether the scan was stopped before completing.
    pub fn is_cancelled(&self) -> bool {
        self.control.is_aborted()
    }

    /// Items returned by `next` so far.
    pub fn items_delivered(&self) -> u64 {
        self.received
    }

    /// Drain the stream, failing on the first error.
    pub async fn collect_all(mut self) -> ScanResult<Vec<ScanItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl futures::Stream<Item = ScanResult<ScanItem>> {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}

impl Drop for ScanResultStream {
    fn drop(&mut self) {
        self.control.stop(StopReason::Closed);
    }
}
