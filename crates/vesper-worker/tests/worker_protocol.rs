//! Request/response round trips through a spawned worker.

use vesper_governor::GovernorConfig;
use vesper_worker::{
    spawn_worker, Backends, WorkerContext, WorkerHandle, WorkerRequest, WorkerResponse,
};

fn small_config() -> GovernorConfig {
    let mut config = GovernorConfig::default();
    config.ledger = config.ledger.with_max_bytes(1000);
    config
}

async fn started(backends: Backends) -> WorkerHandle {
    let (handle, _task) = spawn_worker(WorkerContext::new(backends), 4);
    assert_eq!(
        handle.init(small_config()).await.unwrap(),
        WorkerResponse::Initialized
    );
    handle
}

fn error_kind(response: &WorkerResponse) -> &str {
    match response {
        WorkerResponse::Error { kind, .. } => kind,
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn track_then_status_reports_usage() {
    let handle = started(Backends::in_memory(1 << 20)).await;

    handle.track(400, 0).await.unwrap();
    handle.track(300, 0).await.unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.num_tracked, 2);
    assert_eq!(status.total_bytes_used, 700);
    assert!((status.utilization_percentage - 70.0).abs() < 1e-9);
}

#[tokio::test]
async fn save_and_load_through_the_worker() {
    let handle = started(Backends::in_memory(1 << 20)).await;
    let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();

    let saved = handle
        .send(WorkerRequest::Save {
            store: "tensors".into(),
            key: "w1".into(),
            payload: payload.clone(),
            chunk_size: Some(1000),
        })
        .await
        .unwrap();
    assert_eq!(
        saved,
        WorkerResponse::Saved {
            generation: 1,
            chunks: 3
        }
    );

    let loaded = handle
        .send(WorkerRequest::Load {
            store: "tensors".into(),
            key: "w1".into(),
        })
        .await
        .unwrap();
    assert_eq!(loaded, WorkerResponse::Loaded { payload });
}

#[tokio::test]
async fn failures_come_back_as_error_kinds() {
    let handle = started(Backends::in_memory(1 << 20)).await;

    let missing = handle
        .send(WorkerRequest::Load {
            store: "tensors".into(),
            key: "absent".into(),
        })
        .await
        .unwrap();
    assert_eq!(error_kind(&missing), "not_found");

    let unknown = handle
        .send(WorkerRequest::Clear {
            store: "logs".into(),
        })
        .await
        .unwrap();
    assert_eq!(error_kind(&unknown), "unknown_store");

    // The worker keeps serving after errors
    assert_eq!(handle.status().await.unwrap().num_tracked, 0);
}

#[tokio::test]
async fn pressure_evicts_and_clears_cache() {
    let handle = started(Backends::in_memory(1 << 20)).await;
    handle.track(400, 0).await.unwrap();
    handle.track(400, 0).await.unwrap();
    handle
        .send(WorkerRequest::CacheSet {
            key: "frame".into(),
            payload: vec![7; 64],
            ttl_ms: None,
            priority: 0,
        })
        .await
        .unwrap();

    let response = handle.send(WorkerRequest::Pressure).await.unwrap();
    let WorkerResponse::PressureHandled(report) = response else {
        panic!("unexpected {response:?}");
    };
    assert_eq!(report.allocations_evicted, 1);
    assert_eq!(report.cache_entries_cleared, 1);
    assert!(report.errors.is_empty());

    let cached = handle
        .send(WorkerRequest::CacheGet {
            key: "frame".into(),
        })
        .await
        .unwrap();
    assert_eq!(cached, WorkerResponse::CacheValue { payload: None });
}

#[tokio::test]
async fn shutdown_closes_the_worker() {
    let (handle, task) = spawn_worker(WorkerContext::new(Backends::in_memory(1 << 20)), 4);

    let response = handle.send(WorkerRequest::Shutdown).await.unwrap();
    assert_eq!(response, WorkerResponse::ShuttingDown);
    task.await.unwrap();

    assert!(handle.is_closed());
    let err = handle.send(WorkerRequest::Status).await.unwrap_err();
    assert_eq!(err.kind(), "channel_closed");
}

#[tokio::test]
async fn records_on_disk_outlive_the_worker() {
    let dir = tempfile::tempdir().unwrap();

    let (handle, task) = spawn_worker(
        WorkerContext::new(Backends::with_store_dir(dir.path(), 1 << 20)),
        4,
    );
    handle.init(small_config()).await.unwrap();
    handle
        .send(WorkerRequest::Save {
            store: "checkpoints".into(),
            key: "epoch-3".into(),
            payload: b"state".to_vec(),
            chunk_size: None,
        })
        .await
        .unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let handle = started(Backends::with_store_dir(dir.path(), 1 << 20)).await;
    let loaded = handle
        .send(WorkerRequest::Load {
            store: "checkpoints".into(),
            key: "epoch-3".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        loaded,
        WorkerResponse::Loaded {
            payload: b"state".to_vec()
        }
    );
}

#[test]
fn json_lines_match_the_wire_format() {
    let request: WorkerRequest =
        serde_json::from_str(r#"{"type":"save","store":"tensors","key":"k","payload":[1,2,3]}"#)
            .unwrap();
    assert!(matches!(request, WorkerRequest::Save { chunk_size: None, .. }));

    let line = serde_json::to_string(&WorkerResponse::Evicted { count: 2 }).unwrap();
    assert_eq!(line, r#"{"type":"evicted","count":2}"#);
}
