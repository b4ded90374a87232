#![cfg(feature = "http")]

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use pack_downloader::common::config::{ServiceConfig, StorageConfig, TransferConfig};
use pack_downloader::downloader::DownloadManager;
use pack_downloader::http::router;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

fn app(dir: &Path) -> (Router, Arc<DownloadManager>) {
    let config = ServiceConfig {
        storage: StorageConfig {
            store_dir: dir.join("store"),
            breakpoint_dir: dir.join("bp"),
            min_free_space: 0,
        },
        transfer: TransferConfig {
            buffer_size: 4096,
            shard_size: 8192,
            ..TransferConfig::default()
        },
        ..ServiceConfig::default()
    };
    let manager = Arc::new(DownloadManager::new(config));
    (router(manager.clone()), manager)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_finished(manager: &DownloadManager, task_id: &str) {
    for _ in 0..500 {
        if manager.get_task(task_id).is_some_and(|t| t.finished) && !manager.is_running(task_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("任务未在预期时间内结束: {task_id}");
}

#[tokio::test]
async fn test_store_mode_submit_status_and_download() {
    let dir = TempDir::new().unwrap();
    let (app, manager) = app(dir.path());
    let src = dir.path().join("notes.txt");
    std::fs::write(&src, b"hello from the server").unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/download/submit",
            json!({"filePaths": [src], "userId": "alice"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["code"], 200);
    let task_id = body["taskId"].as_str().unwrap().to_string();

    wait_finished(&manager, &task_id).await;

    let response = app
        .clone()
        .oneshot(get(&format!("/api/download/task/status/{task_id}")))
        .await
        .unwrap();
    let task = json_body(response).await;
    assert_eq!(task["status"], "COMPLETED");
    assert_eq!(task["progress"], 100);
    assert_eq!(task["finished"], true);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/download/server/{task_id}?userId=alice")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"hello from the server");

    let response = app
        .clone()
        .oneshot(get(&format!("/api/download/server/{task_id}?userId=bob")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(get("/api/download/task/all")).await.unwrap();
    let all = json_body(response).await;
    assert_eq!(all.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejections_carry_code_and_message() {
    let dir = TempDir::new().unwrap();
    let (app, _manager) = app(dir.path());

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/download/submit",
            json!({"filePaths": [], "userId": "alice"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], 400);
    assert!(body["message"].as_str().unwrap().contains("文件列表为空"));

    let response = app
        .clone()
        .oneshot(get("/api/download/task/status/unknown"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(post_json("/api/download/task/cancel/unknown", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(post_json("/api/download/task/resume/unknown?userId=alice", json!({})))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["code"], 404);
}

#[tokio::test]
async fn test_direct_single_file_honours_range() {
    let dir = TempDir::new().unwrap();
    let (app, manager) = app(dir.path());
    let src = dir.path().join("data.bin");
    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/api/download/submit")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::RANGE, "bytes=5000-")
        .body(Body::from(
            json!({"filePaths": [src], "userId": "alice", "directDownload": true}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 5000-19999/20000");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "15000");
    let task_id = response.headers()["x-task-id"].to_str().unwrap().to_string();

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], &data[5000..]);

    wait_finished(&manager, &task_id).await;
    let task = manager.get_task(&task_id).unwrap();
    assert_eq!(task.completed_count, 1);
    assert!(task.target_file_path.is_none());
}

#[tokio::test]
async fn test_direct_range_past_end_is_416() {
    let dir = TempDir::new().unwrap();
    let (app, manager) = app(dir.path());
    let src = dir.path().join("data.bin");
    std::fs::write(&src, vec![9u8; 20_000]).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/api/download/submit")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::RANGE, "bytes=20000-")
        .body(Body::from(
            json!({"filePaths": [src], "userId": "alice", "directDownload": true}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */20000");
    let body = json_body(response).await;
    assert_eq!(body["code"], 416);
    assert!(manager.list_tasks().is_empty());
}

#[tokio::test]
async fn test_direct_archive_stream() {
    let dir = TempDir::new().unwrap();
    let (app, _manager) = app(dir.path());
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, "alpha ".repeat(2000)).unwrap();
    std::fs::write(&b, "beta ".repeat(2000)).unwrap();

    let response = app
        .oneshot(post_json(
            "/api/download/submit",
            json!({"filePaths": [a, b], "userId": "alice", "directDownload": true, "compressionLevel": 9}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    assert_eq!(response.headers()["x-resume-offset"], "0");
    let task_id = response.headers()["x-task-id"].to_str().unwrap().to_string();
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.contains(&format!("{task_id}.zip")));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
    assert_eq!(archive.len(), 2);
    let mut content = String::new();
    archive.by_name("b.txt").unwrap().read_to_string(&mut content).unwrap();
    assert_eq!(content, "beta ".repeat(2000));
}

#[tokio::test]
async fn test_progress_stream_for_unknown_task() {
    let dir = TempDir::new().unwrap();
    let (app, _manager) = app(dir.path());

    let response = app
        .oneshot(get("/api/download/task/progress/unknown"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: progress"));
    assert!(text.contains("\"code\":404"));
}
