//! Disk image import over HTTP into a fresh VDI.

mod common;

use std::io::Write;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use xsprov::import::ImportPipeline;
use xsprov::reconciler::vdi::{VdiConfig, VdiReconciler};
use xsprov::retry::RetryPolicy;
use xsprov::test_util::FakeXapi;
use xsprov::xapi::ObjectKind;
use xsprov::{ProviderError, Reconciler};

use common::UploadServer;

fn reconciler() -> VdiReconciler {
    VdiReconciler {
        import: ImportPipeline {
            poll_interval: Duration::from_millis(5),
            max_polls: 20,
            http_timeout: Duration::from_secs(10),
        },
        destroy_retry: RetryPolicy::fixed(Duration::from_millis(5), 10),
    }
}

fn image(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&vec![0x5a; len]).unwrap();
    file.flush().unwrap();
    file
}

fn imported(path: &std::path::Path) -> VdiConfig {
    serde_json::from_value(json!({
        "name_label": "golden",
        "sr_uuid": "sr-1",
        "raw_vdi_path": path,
    }))
    .unwrap()
}

async fn host(server: &UploadServer) -> FakeXapi {
    let fake = FakeXapi::new();
    fake.insert(ObjectKind::Sr, json!({"uuid": "sr-1", "type": "nfs"}));
    fake.set_base_url(&server.url);
    fake
}

#[tokio::test]
async fn raw_image_is_streamed_and_the_task_followed() {
    let server = UploadServer::start().await;
    let fake = host(&server).await;
    fake.script_task_statuses(&["pending", "pending"]);
    let ctx = fake.context();
    let file = image(64 * 1024);

    let state = reconciler().create(&ctx, &imported(file.path())).await.unwrap();
    assert_eq!(state.virtual_size, 64 * 1024);
    assert_eq!(state.raw_vdi_path.as_deref(), Some(file.path()));

    let uploads = server.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].bytes, 64 * 1024);
    assert_eq!(uploads[0].query["format"], "raw");
    let vdi = fake.find_by_uuid(ObjectKind::Vdi, &state.uuid).unwrap();
    assert_eq!(uploads[0].query["vdi"], vdi.as_str());

    assert_eq!(fake.calls_to("task.get_status").len(), 3);
    assert_eq!(fake.count(ObjectKind::Task), 0);
}

#[tokio::test]
async fn rejected_upload_removes_the_disk_and_task() {
    let server = UploadServer::start().await;
    server.reject_with(StatusCode::INTERNAL_SERVER_ERROR);
    let fake = host(&server).await;
    let ctx = fake.context();
    let file = image(4096);

    let err = reconciler().create(&ctx, &imported(file.path())).await.unwrap_err();
    match err {
        ProviderError::UploadRejected { status, body, .. } => {
            assert_eq!(status, 500);
            assert!(body.contains("not attachable"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fake.count(ObjectKind::Vdi), 0);
    assert_eq!(fake.count(ObjectKind::Task), 0);
}

#[tokio::test]
async fn failed_task_reports_its_error_info() {
    let server = UploadServer::start().await;
    let fake = host(&server).await;
    fake.script_task_statuses(&["pending", "failure"]);
    let ctx = fake.context();
    let file = image(4096);

    let err = reconciler().create(&ctx, &imported(file.path())).await.unwrap_err();
    assert!(matches!(err, ProviderError::TaskFailed { .. }));
    assert_eq!(server.uploads().len(), 1);
    assert_eq!(fake.count(ObjectKind::Vdi), 0);
}
