//! Benchmarking utilities for scans.
//!
//! Measures scan throughput against a `SimulatedCluster` with configurable
//! size, per-call latency and concurrency.

use crate::engine::RangeScanEngine;
use crate::sim::SimulatedCluster;
use shardscan_core::error::ScanResult;
use shardscan_core::options::ScanOptions;
use shardscan_core::scan::{PrefixScan, RangeScan, SamplingScan, ScanType};
use shardscan_core::types::NodeIndex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which kind of scan to benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchScan {
    Range,
    Prefix,
    Sampling(u64),
}

/// Configuration for benchmark runs.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Number of nodes.
    pub num_nodes: usize,
    /// Number of partitions.
    pub num_partitions: u16,
    /// Number of documents to load.
    pub num_documents: usize,
    /// Size of each document body in bytes.
    pub value_size: usize,
    /// Simulated latency of every create and continue.
    pub latency: Duration,
    /// Scan concurrency.
    pub concurrency: usize,
    /// Items per continue.
    pub batch_item_limit: u32,
    /// Return keys only.
    pub ids_only: bool,
    /// Scan kind.
    pub scan: BenchScan,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            num_nodes: 3,
            num_partitions: 64,
            num_documents: 10_000,
            value_size: 128,
            latency: Duration::from_micros(200),
            concurrency: 1,
            batch_item_limit: 50,
            ids_only: false,
            scan: BenchScan::Range,
        }
    }
}

impl BenchConfig {
    /// Create a new benchmark configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of nodes.
    pub fn with_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    /// Set the number of partitions.
    pub fn with_partitions(mut self, num_partitions: u16) -> Self {
        self.num_partitions = num_partitions;
        self
    }

    /// Set the number of documents.
    pub fn with_documents(mut self, num_documents: usize) -> Self {
        self.num_documents = num_documents;
        self
    }

    /// Set the simulated per-call latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the scan concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the items per batch.
    pub fn with_batch_item_limit(mut self, limit: u32) -> Self {
        self.batch_item_limit = limit;
        self
    }

    /// Return keys only.
    pub fn with_ids_only(mut self, ids_only: bool) -> Self {
        self.ids_only = ids_only;
        self
    }

    /// Set the scan kind.
    pub fn with_scan(mut self, scan: BenchScan) -> Self {
        self.scan = scan;
        self
    }

    fn scan_type(&self) -> ScanType {
        match self.scan {
            BenchScan::Range => RangeScan::new().into(),
            BenchScan::Prefix => PrefixScan::new("doc_1").into(),
            BenchScan::Sampling(limit) => SamplingScan::new(limit).into(),
        }
    }

    fn options(&self) -> ScanOptions {
        ScanOptions::new()
            .with_concurrency(self.concurrency)
            .with_batch_item_limit(self.batch_item_limit)
            .with_ids_only(self.ids_only)
    }
}

/// Results from a benchmark run.
#[derive(Debug, Clone)]
pub struct BenchResults {
    /// Time to load the cluster.
    pub setup_time: Duration,
    /// Time from starting the scan to the first item.
    pub first_item_time: Duration,
    /// Time to drain the scan.
    pub scan_time: Duration,
    /// Items returned.
    pub items: usize,
    /// Items per second over the whole scan.
    pub items_per_second: f64,
    /// Continue calls issued.
    pub continues: usize,
    /// Highest concurrent session count seen on any node.
    pub max_sessions_per_node: usize,
    /// Concurrency used.
    pub concurrency: usize,
    /// Number of nodes used.
    pub num_nodes: usize,
    /// Number of partitions used.
    pub num_partitions: u16,
}

impl BenchResults {
    /// Print a formatted summary.
    pub fn print_summary(&self) {
        println!("\n=== Scan Benchmark Results ===\n");
        println!("Configuration:");
        println!(
            "  Nodes: {}, Partitions: {}, Concurrency: {}",
            self.num_nodes, self.num_partitions, self.concurrency
        );
        println!();
        println!("Timing:");
        println!("  Setup time:       {:?}", self.setup_time);
        println!("  First item after: {:?}", self.first_item_time);
        println!(
            "  Scan time:        {:?} ({:.1} items/sec)",
            self.scan_time, self.items_per_second
        );
        println!();
        println!("Traffic:");
        println!("  Items:            {}", self.items);
        println!("  Continue calls:   {}", self.continues);
        println!("  Max sessions/node: {}", self.max_sessions_per_node);
    }
}

/// Load a cluster for `config`.
pub fn build_cluster(config: &BenchConfig) -> Arc<SimulatedCluster> {
    let cluster = SimulatedCluster::new(config.num_nodes.max(1), config.num_partitions.max(1));
    for i in 0..config.num_documents {
        let body = serde_json::json!({ "id": i, "pad": "x".repeat(config.value_size) });
        cluster.upsert(format!("doc_{i}"), body.to_string());
    }
    cluster.set_latency(config.latency);
    Arc::new(cluster)
}

/// Run one scan benchmark.
pub async fn run_benchmark(config: BenchConfig) -> ScanResult<BenchResults> {
    let setup_start = Instant::now();
    let cluster = build_cluster(&config);
    let setup_time = setup_start.elapsed();

    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));
    let scan_start = Instant::now();
    let mut stream = engine
        .scan(&cluster.default_keyspace(), config.scan_type(), config.options())
        .await?;
    let first_item_time = scan_start.elapsed();

    let mut items = 0usize;
    while let Some(item) = stream.next().await {
        item?;
        items += 1;
    }
    let scan_time = scan_start.elapsed();

    let max_sessions_per_node = (0..config.num_nodes)
        .map(|n| cluster.max_concurrent_sessions(NodeIndex::new(n)))
        .max()
        .unwrap_or(0);

    Ok(BenchResults {
        setup_time,
        first_item_time,
        scan_time,
        items,
        items_per_second: items as f64 / scan_time.as_secs_f64().max(f64::EPSILON),
        continues: cluster.continue_count(),
        max_sessions_per_node,
        concurrency: config.concurrency,
        num_nodes: config.num_nodes,
        num_partitions: config.num_partitions,
    })
}

/// Run the same scan at each concurrency level.
pub async fn scaling_benchmark(
    base: BenchConfig,
    concurrency_levels: &[usize],
) -> ScanResult<Vec<BenchResults>> {
    let mut results = Vec::with_capacity(concurrency_levels.len());
    for &concurrency in concurrency_levels {
        results.push(run_benchmark(base.clone().with_concurrency(concurrency)).await?);
    }
    Ok(results)
}
