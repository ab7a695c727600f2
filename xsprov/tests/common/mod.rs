//! Shared helpers for the xsprov integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::put;
use tokio::net::TcpListener;

use xsprov::retry::RetryPolicy;

/// One request received by [`UploadServer`].
#[derive(Debug, Clone)]
pub struct Upload {
    pub query: HashMap<String, String>,
    pub bytes: usize,
}

#[derive(Default)]
struct Received {
    uploads: Vec<Upload>,
    reject: Option<StatusCode>,
}

/// Stand-in for the coordinator's `import_raw_vdi` HTTP handler.
#[derive(Clone)]
pub struct UploadServer {
    pub url: String,
    received: Arc<Mutex<Received>>,
}

impl UploadServer {
    pub async fn start() -> Self {
        let received = Arc::new(Mutex::new(Received::default()));
        let app = Router::new()
            .route("/import_raw_vdi", put(import_raw_vdi))
            .with_state(received.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            received,
        }
    }

    /// Answer every following upload with `status`.
    pub fn reject_with(&self, status: StatusCode) {
        self.received.lock().unwrap().reject = Some(status);
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.received.lock().unwrap().uploads.clone()
    }
}

async fn import_raw_vdi(
    State(received): State<Arc<Mutex<Received>>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let mut received = received.lock().unwrap();
    received.uploads.push(Upload {
        query,
        bytes: body.len(),
    });
    match received.reject {
        Some(status) => (status, "VDI is not attachable"),
        None => (StatusCode::OK, ""),
    }
}

/// Backoff short enough for tests to converge in milliseconds.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        max_elapsed: Duration::from_millis(300),
        multiplier: 1.5,
        randomization_factor: 0.0,
    }
}
