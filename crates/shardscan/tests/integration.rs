//! End-to-end scan tests against the simulated cluster.
//!
//! Covers the full scan lifecycle: placement, dispatch across nodes,
//! retries, resume after lost sessions, deadlines, cancellation and
//! consistency requirements.

use futures::StreamExt;
use serde::Deserialize;
use shardscan::prelude::*;
use shardscan::sim::SimulatedCluster;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Helper: two nodes owning {0,1,2} and {3,4}, one document per partition.
fn create_cluster() -> Arc<SimulatedCluster> {
    let cluster = SimulatedCluster::with_placement(vec![vec![0, 1, 2], vec![3, 4]]).unwrap();
    for p in 0..5u16 {
        cluster.insert_into(0, PartitionId::new(p), format!("doc-{p}"), format!("{{\"p\":{p}}}"));
    }
    Arc::new(cluster)
}

/// Helper: a cluster with `count` routed documents keyed `{prefix}{i}`.
fn loaded_cluster(nodes: usize, partitions: u16, prefix: &str, count: usize) -> Arc<SimulatedCluster> {
    let cluster = SimulatedCluster::new(nodes, partitions);
    for i in 0..count {
        cluster.upsert(format!("{prefix}{i}"), format!("{{\"n\":{i}}}"));
    }
    Arc::new(cluster)
}

async fn keys_of(stream: ScanResultStream) -> Vec<String> {
    let mut keys: Vec<String> = stream
        .collect_all()
        .await
        .unwrap()
        .iter()
        .map(ScanItem::key_str)
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_two_nodes_every_partition_once() {
    let cluster = create_cluster();
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_concurrency(2),
        )
        .await
        .unwrap();

    assert_eq!(
        keys_of(stream).await,
        vec!["doc-0", "doc-1", "doc-2", "doc-3", "doc-4"]
    );
    let mut partitions: Vec<u16> = cluster
        .create_log()
        .iter()
        .map(|r| r.partition.as_u16())
        .collect();
    partitions.sort();
    assert_eq!(partitions, vec![0, 1, 2, 3, 4]);
    assert_eq!(cluster.open_sessions(), 0);
}

#[tokio::test]
async fn test_creates_go_to_owning_node() {
    let cluster = create_cluster();
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new().with_concurrency(2))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    for record in cluster.create_log() {
        let expected = if record.partition.as_u16() < 3 { 0 } else { 1 };
        assert_eq!(record.node, NodeIndex::new(expected));
    }
}

#[tokio::test]
async fn test_busy_partition_requeued_single_worker() {
    let cluster = create_cluster();
    cluster.fail_create(PartitionId::new(3), TransportErrorKind::Busy, 1);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new())
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await.len(), 5);

    let attempts = cluster
        .create_log()
        .iter()
        .filter(|r| r.partition == PartitionId::new(3))
        .count();
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_temporary_failures_with_many_workers() {
    let cluster = loaded_cluster(3, 12, "k", 120);
    for p in [1u16, 5, 9] {
        cluster.fail_create(PartitionId::new(p), TransportErrorKind::TemporaryFailure, 3);
    }
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new().with_concurrency(4))
        .await
        .unwrap();
    let keys = keys_of(stream).await;
    assert_eq!(keys.len(), 120);
    assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 120);
}

#[tokio::test]
async fn test_deadline_before_create_completes() {
    let cluster = create_cluster();
    cluster.set_latency(Duration::from_millis(200));
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let err = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new()
                .with_concurrency(2)
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, ScanError::Timeout);

    // In-flight creates finish later and their sessions are released.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cluster.open_sessions(), 0);
    assert_eq!(cluster.cancel_count(), cluster.create_log().len());
    assert_eq!(cluster.continue_count(), 0);
}

#[tokio::test]
async fn test_deadline_mid_scan_reports_timeout() {
    let cluster = loaded_cluster(1, 2, "k", 50);
    cluster.set_latency(Duration::from_millis(20));
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let mut stream = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new()
                .with_batch_item_limit(1)
                .with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let mut errors = Vec::new();
    while let Some(item) = stream.next().await {
        if let Err(err) = item {
            errors.push(err);
        }
    }
    assert_eq!(errors, vec![ScanError::Timeout]);
    assert!(stream.is_cancelled());
}

#[tokio::test]
async fn test_sampling_limit_zero_rejected() {
    let cluster = create_cluster();
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let err = engine
        .scan(&cluster.default_keyspace(), SamplingScan::new(0), ScanOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidArgument(_)));
    assert_eq!(cluster.snapshot_requests(), 0);
    assert!(cluster.create_log().is_empty());
}

#[tokio::test]
async fn test_resume_after_not_my_vbucket() {
    let cluster = SimulatedCluster::new(1, 1);
    for i in 1..=5 {
        cluster.insert_into(0, PartitionId::new(0), format!("k{i}"), "{}");
    }
    cluster.fail_continue(PartitionId::new(0), TransportErrorKind::NotMyVbucket, 1);
    let cluster = Arc::new(cluster);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_batch_item_limit(2),
        )
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await, vec!["k1", "k2", "k3", "k4", "k5"]);

    let creates = cluster.create_log();
    assert_eq!(creates.len(), 2);
    match &creates[1].scan.request {
        ScanRequest::Range { start, end } => {
            assert_eq!(*start, ScanTerm::exclusive("k2"));
            assert_eq!(*end, ScanTerm::maximum());
        }
        other => panic!("unexpected resume request {other:?}"),
    }
}

#[tokio::test]
async fn test_resume_after_end_of_stream() {
    let cluster = SimulatedCluster::new(1, 1);
    for i in 0..6 {
        cluster.insert_into(0, PartitionId::new(0), format!("k{i}"), "{}");
    }
    cluster.fail_continue(PartitionId::new(0), TransportErrorKind::EndOfStream, 2);
    let cluster = Arc::new(cluster);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_batch_item_limit(2),
        )
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await.len(), 6);
    assert_eq!(cluster.create_log().len(), 2);
}

#[tokio::test]
async fn test_prefix_scan() {
    let cluster = loaded_cluster(2, 8, "airline_", 5);
    for i in 0..5 {
        cluster.upsert(format!("hotel_{i}"), "{}");
    }
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(&cluster.default_keyspace(), PrefixScan::new("airline_"), ScanOptions::new())
        .await
        .unwrap();
    let keys = keys_of(stream).await;
    assert_eq!(keys.len(), 5);
    assert!(keys.iter().all(|k| k.starts_with("airline_")));
}

#[tokio::test]
async fn test_bounded_range_scan() {
    let cluster = loaded_cluster(2, 4, "k", 10);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let range = RangeScan::new()
        .from(ScanTerm::inclusive("k3"))
        .to(ScanTerm::exclusive("k6"));
    let stream = engine
        .scan(&cluster.default_keyspace(), range, ScanOptions::new())
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await, vec!["k3", "k4", "k5"]);
}

#[derive(Debug, Deserialize)]
struct Counter {
    n: usize,
}

#[tokio::test]
async fn test_ids_only_and_full_documents() {
    let cluster = loaded_cluster(2, 4, "k", 8);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let ids = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new().with_ids_only(true))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(ids.len(), 8);
    assert!(ids.iter().all(ScanItem::is_id_only));
    assert!(ids[0].content_as::<Counter>().is_err());

    let docs = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new())
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let mut total = 0;
    for doc in &docs {
        assert!(doc.cas > 0);
        total += doc.content_as::<Counter>().unwrap().n;
    }
    assert_eq!(total, (0..8).sum::<usize>());
}

#[tokio::test]
async fn test_sampling_scan_respects_limit() {
    let cluster = loaded_cluster(2, 8, "k", 200);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(
            &cluster.default_keyspace(),
            SamplingScan::new(10).with_seed(42),
            ScanOptions::new().with_concurrency(3),
        )
        .await
        .unwrap();
    let keys = keys_of(stream).await;
    assert_eq!(keys.len(), 10);
    assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 10);

    for record in cluster.create_log() {
        assert_eq!(record.scan.request, ScanRequest::Sampling { limit: 10, seed: 42 });
    }
}

#[tokio::test]
async fn test_sampling_skips_empty_partitions() {
    let cluster = SimulatedCluster::new(2, 4);
    cluster.insert_into(0, PartitionId::new(0), "only-a", "{}");
    cluster.insert_into(0, PartitionId::new(0), "only-b", "{}");
    let cluster = Arc::new(cluster);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(&cluster.default_keyspace(), SamplingScan::new(5), ScanOptions::new())
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await, vec!["only-a", "only-b"]);
}

#[tokio::test]
async fn test_consistent_with_reaches_create() {
    let cluster = create_cluster();
    let token = cluster.insert_into(0, PartitionId::new(2), "fresh", "{}");
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let options = ScanOptions::new().with_consistent_with(MutationState::new().with_token(token.clone()));
    let stream = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), options)
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await.len(), 6);

    for record in cluster.create_log() {
        if record.partition == PartitionId::new(2) {
            let requirement = record.scan.snapshot.unwrap();
            assert_eq!(requirement.seq_no, token.seq_no);
            assert_eq!(requirement.partition_uuid, token.partition_uuid);
        } else {
            assert!(record.scan.snapshot.is_none());
        }
    }
}

#[tokio::test]
async fn test_consistent_with_other_bucket_rejected() {
    let cluster = create_cluster();
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));
    let token = MutationToken {
        bucket: "elsewhere".to_string(),
        partition: PartitionId::new(0),
        partition_uuid: 1,
        seq_no: 1,
    };

    let err = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_consistent_with(MutationState::new().with_token(token)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_named_collection() {
    let cluster = SimulatedCluster::new(2, 4);
    let id = cluster.add_collection("inventory", "airline");
    cluster.insert_into(id, PartitionId::new(1), "airline_10", "{}");
    cluster.upsert("not-in-collection", "{}");
    let cluster = Arc::new(cluster);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let keyspace = Keyspace::new("sim", "inventory", "airline");
    let stream = engine
        .scan(&keyspace, RangeScan::new(), ScanOptions::new())
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await, vec!["airline_10"]);
    assert!(cluster.create_log().iter().all(|r| r.scan.collection_id == id));
}

#[tokio::test]
async fn test_fatal_error_reported_once() {
    let cluster = loaded_cluster(2, 6, "k", 60);
    cluster.fail_continue(PartitionId::new(4), TransportErrorKind::Other, 0);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let result = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_concurrency(2).with_batch_item_limit(1),
        )
        .await;

    let errors = match result {
        Err(err) => vec![err],
        Ok(mut stream) => {
            let mut errors = Vec::new();
            while let Some(item) = stream.next().await {
                if let Err(err) = item {
                    errors.push(err);
                }
            }
            assert!(stream.next().await.is_none());
            errors
        }
    };
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ScanError::Transport { partition, .. } if *partition == PartitionId::new(4)
    ));
}

#[tokio::test]
async fn test_range_continue_errors_are_fatal() {
    let cases = [
        (
            TransportErrorKind::DocumentNotFound,
            ScanError::DocumentNotFound {
                partition: PartitionId::new(2),
            },
        ),
        (
            TransportErrorKind::AuthenticationFailure,
            ScanError::AuthenticationFailure,
        ),
        (
            TransportErrorKind::CollectionNotFound,
            ScanError::CollectionNotFound {
                scope: "_default".to_string(),
                collection: "_default".to_string(),
            },
        ),
    ];
    for (kind, expected) in cases {
        let cluster = create_cluster();
        cluster.fail_continue(PartitionId::new(2), kind, 0);
        let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

        let result = engine
            .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new())
            .await;
        let err = match result {
            Err(err) => err,
            Ok(stream) => stream.collect_all().await.unwrap_err(),
        };
        assert_eq!(err, expected, "{kind}");
    }
}

#[tokio::test]
async fn test_sampling_skips_partitions_failing_on_continue() {
    for kind in [
        TransportErrorKind::DocumentNotFound,
        TransportErrorKind::AuthenticationFailure,
        TransportErrorKind::CollectionNotFound,
    ] {
        let cluster = create_cluster();
        cluster.fail_continue(PartitionId::new(2), kind, 0);
        let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

        let stream = engine
            .scan(
                &cluster.default_keyspace(),
                SamplingScan::new(10),
                ScanOptions::new().with_concurrency(2),
            )
            .await
            .unwrap();
        assert_eq!(
            keys_of(stream).await,
            vec!["doc-0", "doc-1", "doc-3", "doc-4"],
            "{kind}"
        );
        assert_eq!(cluster.open_sessions(), 0);
    }
}

#[tokio::test]
async fn test_range_auth_failure_is_fatal() {
    let cluster = create_cluster();
    cluster.fail_create(PartitionId::new(0), TransportErrorKind::AuthenticationFailure, 1);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let result = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new())
        .await;
    let err = match result {
        Err(err) => err,
        Ok(stream) => stream.collect_all().await.unwrap_err(),
    };
    assert_eq!(err, ScanError::AuthenticationFailure);
}

#[tokio::test]
async fn test_close_is_idempotent_and_releases_sessions() {
    let cluster = loaded_cluster(2, 4, "k", 200);
    cluster.set_latency(Duration::from_millis(5));
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let mut stream = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_concurrency(2).with_batch_item_limit(2),
        )
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    assert!(stream.close());
    assert!(!stream.close());
    assert!(stream.next().await.is_none());
    assert!(stream.err().is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.open_sessions(), 0);
}

#[tokio::test]
async fn test_close_after_workers_finish_ends_stream() {
    let cluster = loaded_cluster(1, 2, "k", 5);
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let mut stream = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(stream.close());
    let mut after_close = 0;
    while let Some(item) = stream.next().await {
        item.unwrap();
        after_close += 1;
    }
    assert_eq!(after_close, 0);
    assert_eq!(cluster.open_sessions(), 0);
}

#[tokio::test]
async fn test_dropping_stream_releases_sessions() {
    let cluster = loaded_cluster(2, 4, "k", 200);
    cluster.set_latency(Duration::from_millis(5));
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_concurrency(4).with_batch_item_limit(1),
        )
        .await
        .unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.open_sessions(), 0);
    assert!(cluster.continue_count() < 200);
}

#[tokio::test]
async fn test_concurrency_bounds_sessions_per_node() {
    let cluster = loaded_cluster(2, 16, "k", 400);
    cluster.set_latency(Duration::from_millis(1));
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let stream = engine
        .scan(
            &cluster.default_keyspace(),
            RangeScan::new(),
            ScanOptions::new().with_concurrency(3).with_batch_item_limit(10),
        )
        .await
        .unwrap();
    assert_eq!(keys_of(stream).await.len(), 400);

    let per_node: Vec<usize> = (0..2)
        .map(|n| cluster.max_concurrent_sessions(NodeIndex::new(n)))
        .collect();
    assert!(per_node.iter().all(|&m| (1..=3).contains(&m)));
}

#[tokio::test]
async fn test_into_stream_adapter() {
    let cluster = create_cluster();
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));

    let keys: Vec<String> = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), ScanOptions::new())
        .await
        .unwrap()
        .into_stream()
        .map(|item| item.unwrap().key_str())
        .collect()
        .await;
    assert_eq!(keys.len(), 5);
}

#[tokio::test]
async fn test_options_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "concurrency = 2\nids_only = true\nbatch_item_limit = 3").unwrap();
    let options = ScanOptions::from_file(file.path()).unwrap();

    let cluster = create_cluster();
    let engine = RangeScanEngine::from_cluster(Arc::clone(&cluster));
    let items = engine
        .scan(&cluster.default_keyspace(), RangeScan::new(), options)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(items.len(), 5);
    assert!(items.iter().all(ScanItem::is_id_only));
}
