//! Scan benchmark runner.
//!
//! Run with: cargo run --bin shardscan-bench --release -- quick

use anyhow::Result;
use clap::{Parser, Subcommand};
use shardscan::bench::{run_benchmark, scaling_benchmark, BenchConfig, BenchScan};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardscan-bench")]
#[command(author, version, about = "Range scan benchmarks against a simulated cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a quick benchmark with default settings
    Quick,

    /// Run the same scan across several concurrency levels
    Scale {
        /// Comma separated concurrency levels
        #[arg(short, long, default_value = "1,2,4,8,16")]
        levels: String,

        /// Number of documents
        #[arg(short, long, default_value = "20000")]
        docs: usize,
    },

    /// Run with custom parameters
    Custom {
        /// Number of nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Number of partitions
        #[arg(long, default_value = "64")]
        partitions: u16,

        /// Number of documents
        #[arg(long, default_value = "10000")]
        docs: usize,

        /// Scan concurrency
        #[arg(short, long, default_value = "4")]
        concurrency: usize,

        /// Per-call latency in microseconds
        #[arg(long, default_value = "200")]
        latency_us: u64,

        /// Items per batch
        #[arg(long, default_value = "50")]
        batch: u32,

        /// Return keys only
        #[arg(long)]
        ids_only: bool,

        /// Run a sampling scan with this limit instead of a range scan
        #[arg(long)]
        sample: Option<u64>,
    },
}

fn parse_levels(levels: &str) -> Result<Vec<usize>> {
    levels
        .split(',')
        .map(|level| Ok(level.trim().parse::<usize>()?))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Quick => {
            println!("Running quick benchmark...");
            let result = run_benchmark(BenchConfig::new().with_documents(2_000).with_concurrency(4)).await?;
            result.print_summary();
        }

        Commands::Scale { levels, docs } => {
            let levels = parse_levels(&levels)?;
            println!("Running scaling benchmark...");
            let results = scaling_benchmark(BenchConfig::new().with_documents(docs), &levels).await?;

            println!("\n=== Scaling Results ===\n");
            println!(
                "| {:>11} | {:>12} | {:>10} | {:>9} | {:>13} |",
                "Concurrency", "Items/sec", "Items", "Continues", "Sessions/node"
            );
            println!("|-------------|--------------|------------|-----------|---------------|");
            for r in &results {
                println!(
                    "| {:>11} | {:>12.1} | {:>10} | {:>9} | {:>13} |",
                    r.concurrency, r.items_per_second, r.items, r.continues, r.max_sessions_per_node
                );
            }
        }

        Commands::Custom {
            nodes,
            partitions,
            docs,
            concurrency,
            latency_us,
            batch,
            ids_only,
            sample,
        } => {
            let config = BenchConfig::new()
                .with_nodes(nodes)
                .with_partitions(partitions)
                .with_documents(docs)
                .with_concurrency(concurrency)
                .with_latency(Duration::from_micros(latency_us))
                .with_batch_item_limit(batch)
                .with_ids_only(ids_only)
                .with_scan(sample.map_or(BenchScan::Range, BenchScan::Sampling));

            println!("Running custom benchmark...");
            let result = run_benchmark(config).await?;
            result.print_summary();
        }
    }

    Ok(())
}
