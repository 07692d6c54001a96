//! Concurrent uploads against one server

mod common;

use common::{generate_binary, staging_files, TestServer};
use std::sync::Arc;

#[tokio::test]
async fn test_parallel_uploads_of_distinct_files() {
    let server = Arc::new(TestServer::start().await);

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let server = server.clone();
        handles.push(tokio::spawn(async move {
            let data = generate_binary(64 * 1024, i);
            let resp = server.put(&format!("file-{}.bin", i), data.clone()).await;
            (resp.status().as_u16(), data)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let (status, data) = handle.await.unwrap();
        assert_eq!(status, 201, "upload {} failed", i);
        let body = server.get(&format!("file-{}.bin", i)).await.bytes().await.unwrap();
        assert_eq!(body.as_ref(), data.as_slice());
    }
    assert!(staging_files(&server.files_dir()).is_empty());
}

#[tokio::test]
async fn test_racing_updates_leave_one_complete_version() {
    let server = Arc::new(TestServer::start().await);
    server.put("shared.bin", b"seed".to_vec()).await;

    let versions: Vec<Vec<u8>> = (0..8u64).map(|i| generate_binary(256 * 1024, 100 + i)).collect();
    let mut handles = Vec::new();
    for data in versions.iter().cloned() {
        let server = server.clone();
        handles.push(tokio::spawn(async move {
            server.put("shared.bin", data).await.status().as_u16()
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        let status = handle.await.unwrap();
        // losers of the lock race fail fast with FileLocked
        assert!(status == 204 || status == 409, "unexpected status {}", status);
        if status == 204 {
            succeeded += 1;
        }
    }

    let body = server.get("shared.bin").await.bytes().await.unwrap();
    if succeeded == 0 {
        assert_eq!(body.as_ref(), b"seed");
    } else {
        assert!(
            versions.iter().any(|v| v.as_slice() == body.as_ref()),
            "final content must be exactly one uploaded version"
        );
    }

    // a conflict is transient: once the race is over an update goes through
    let resp = server.put("shared.bin", b"settled".to_vec()).await;
    assert_eq!(resp.status().as_u16(), 204);
    assert!(staging_files(&server.files_dir()).is_empty());
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = TestServer::start().await;
    server.put("counted.txt", "x").await;

    let resp = server
        .client()
        .get(format!("{}/health", server.endpoint()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let health: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["staging_writes"], true);
    assert_eq!(health["active_locks"], 0);

    let resp = server
        .client()
        .get(format!("{}/metrics", server.endpoint()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("webdav_ingest_uploads_total{outcome=\"created\"} 1"), "{}", text);
    assert!(text.contains("webdav_ingest_file_events_total"), "{}", text);
}
