//! JSON-RPC transport to a XenAPI host.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::{Connector, RemoteError, Session, Transport, XapiError, host_url};

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a [Value],
    id: u64,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl ErrorObject {
    fn into_remote(self) -> RemoteError {
        let params = match self.data {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(s)) => vec![s],
            _ => Vec::new(),
        };
        RemoteError::new(self.message, params)
    }
}

/// Posts JSON-RPC 2.0 requests to `{host}/jsonrpc`.
pub struct JsonRpcTransport {
    client: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    /// Build a transport for `base_url`. Hosts present self-signed
    /// certificates, so certificate validation is disabled.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, XapiError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| XapiError::Transport {
                method: "client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: format!("{}/jsonrpc", base_url.trim_end_matches('/')),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Transport for JsonRpcTransport {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, XapiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(method, id, "jsonrpc call");

        let transport_err = |e: reqwest::Error| XapiError::Transport {
            method: method.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&Request {
                jsonrpc: "2.0",
                method,
                params: &params,
                id,
            })
            .send()
            .await
            .map_err(transport_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(XapiError::Transport {
                method: method.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let body: Response = response.json().await.map_err(|e| XapiError::Decode {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(error) = body.error {
            let err = error.into_remote();
            debug!(method, code = %err.code, "remote error");
            return Err(err.into());
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

/// Logs in to hosts over JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcConnector {
    timeout: Duration,
}

impl JsonRpcConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for JsonRpcConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl Connector for JsonRpcConnector {
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Session, XapiError> {
        let base_url = host_url(host);
        let transport = Arc::new(JsonRpcTransport::new(&base_url, self.timeout)?);
        Session::login(transport, base_url, username, password).await
    }
}
