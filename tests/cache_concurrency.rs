//! Concurrency properties: single-flight loading and background warming.

use geodex_core::{
    CancelToken, ClusterInfo, ColumnDef, DatasetDescriptor, Envelope, FieldKind, FieldValue,
    MemoryDataset, MemoryDatasetService, PartitionKey, PrefetchConfig, PrefetchRequest,
    PrefetchService, RangeQueryRouter, RouterConfig, Row, Schema, TieredPartitionCache,
};
use geo_types::Point;
use std::sync::Arc;
use std::time::Duration;

fn point_schema() -> Schema {
    Schema::new(vec![
        ColumnDef::new("id", FieldKind::Int),
        ColumnDef::new("geom", FieldKind::Geometry),
    ])
}

fn point_row(id: i64, x: f64, y: f64) -> Row {
    Row::new(vec![
        FieldValue::Int(id),
        FieldValue::Geometry(Point::new(x, y).into()),
    ])
}

/// 15-cluster strip dataset; wide enough that strip queries never cover it.
fn grid_service() -> Arc<MemoryDatasetService> {
    let svc = MemoryDatasetService::new();
    let descriptor = DatasetDescriptor::new("grid", point_schema())
        .with_bounds(Envelope::new(0.0, 0.0, 200.0, 100.0))
        .with_record_count(1000)
        .clustered();
    let mut dataset = MemoryDataset::new(descriptor, Vec::new());
    let mut all_rows = Vec::new();
    for i in 0..15u32 {
        let x0 = i as f64 * 6.0;
        let strip = Envelope::new(x0, 0.0, x0 + 6.0, 10.0);
        let rows: Vec<Row> = (0..10)
            .map(|j| point_row((i * 100 + j) as i64, x0 + 3.0, 0.5 + j as f64 * 0.9))
            .collect();
        all_rows.extend(rows.clone());
        dataset = dataset.with_cluster(
            ClusterInfo {
                quad_key: format!("{}{}", i / 4, i % 4),
                data_bounds: strip,
                tile_bounds: strip,
                row_count: 10,
            },
            rows,
        );
    }
    dataset.rows = all_rows;
    svc.insert_dataset(dataset);
    Arc::new(svc)
}

#[tokio::test]
async fn concurrent_routes_share_partition_fetches() {
    let svc = MemoryDatasetService::new();
    let bounds = Envelope::new(0.0, 0.0, 100.0, 100.0);
    let descriptor = DatasetDescriptor::new("pair", point_schema())
        .with_bounds(bounds)
        .with_record_count(100)
        .clustered();
    let west: Vec<Row> = (0..8).map(|i| point_row(i, 10.0 + i as f64, 25.0)).collect();
    let east: Vec<Row> = (0..8).map(|i| point_row(50 + i, 60.0 + i as f64, 25.0)).collect();
    let dataset = MemoryDataset::new(descriptor, [west.clone(), east.clone()].concat())
        .with_cluster(
            ClusterInfo {
                quad_key: "0".to_string(),
                data_bounds: Envelope::new(10.0, 20.0, 18.0, 30.0),
                tile_bounds: Envelope::new(0.0, 0.0, 50.0, 50.0),
                row_count: 8,
            },
            west,
        )
        .with_cluster(
            ClusterInfo {
                quad_key: "1".to_string(),
                data_bounds: Envelope::new(60.0, 20.0, 68.0, 30.0),
                tile_bounds: Envelope::new(50.0, 0.0, 100.0, 50.0),
                row_count: 8,
            },
            east,
        );
    svc.insert_dataset(dataset);
    let svc = Arc::new(svc);

    let dir = tempfile::tempdir().unwrap();
    let config = RouterConfig::default()
        .with_disk_cache_root(dir.into_path())
        .with_prefetch(PrefetchConfig::disabled());
    let router = Arc::new(RangeQueryRouter::new(svc.clone(), config));

    let envelope = Envelope::new(0.0, 0.0, 100.0, 45.0);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router
                .route("pair", &envelope, None)
                .await
                .unwrap()
                .collect()
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().len(), 16);
    }

    // Both clusters were fetched exactly once despite 8 concurrent queries.
    assert_eq!(svc.counts().raw_cluster, 2);
}

#[tokio::test]
async fn delegated_scan_warms_cache_in_background() {
    let svc = grid_service();
    let dir = tempfile::tempdir().unwrap();
    let config = RouterConfig::default()
        .with_disk_cache_root(dir.into_path())
        .with_prefetch(PrefetchConfig::with_workers(2));
    let router = RangeQueryRouter::new(svc.clone(), config);

    // Drain to exhaustion so the query's token is never cancelled and the
    // background warm-up may finish.
    let rows = router
        .route("grid", &Envelope::new(0.0, 0.0, 95.0, 10.0), None)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 150);
    assert_eq!(svc.counts().range_scan, 1);

    // All fifteen clusters were uncached, so all were enqueued for warming.
    let keys: Vec<PartitionKey> = (0..15u32)
        .map(|i| PartitionKey::new("grid", format!("{}{}", i / 4, i % 4)))
        .collect();
    let mut warmed = false;
    for _ in 0..300 {
        let mut on_disk = 0;
        for key in &keys {
            if router.cache().exists_on_disk(key).await {
                on_disk += 1;
            }
        }
        if on_disk == keys.len() {
            warmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(warmed, "prefetch did not warm all clusters in time");
    assert_eq!(svc.counts().raw_cluster, 15);

    // Warmed partitions are disk-only until a get decodes them.
    assert!(!router.cache().exists_in_memory(&keys[0]));
}

#[tokio::test]
async fn cancelled_prefetch_request_is_skipped() {
    let svc = grid_service();
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(TieredPartitionCache::new(
        svc.clone(),
        dir.path(),
        64 * 1024 * 1024,
        Duration::from_secs(600),
    ));
    let prefetch = PrefetchService::start(PrefetchConfig::with_workers(2), cache.clone(), svc.clone());

    let cancel = CancelToken::new();
    cancel.cancel();
    let key = PartitionKey::new("grid", "00");
    assert!(prefetch.try_enqueue(PrefetchRequest {
        key: key.clone(),
        cancel,
    }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(svc.counts().raw_cluster, 0);
    assert!(!cache.exists_on_disk(&key).await);
}
