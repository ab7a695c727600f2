//! XenAPI gateway.
//!
//! Remote objects are addressed by opaque references and reached through a
//! [`Transport`]. A [`Session`] prepends its session reference to every call
//! and exposes the generic per-class operations (`get_record`, `get_by_uuid`,
//! `set_<field>`, ...) that the reconcilers are built on. Lifecycle calls that
//! do not follow the generic shape go through [`Session::invoke`].

mod jsonrpc;
pub mod records;

pub use jsonrpc::{JsonRpcConnector, JsonRpcTransport};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Sentinel the toolstack uses for "no object".
pub const NULL_REF: &str = "OpaqueRef:NULL";

/// API version sent on login.
pub const API_VERSION: &str = "1.0";

/// Originator string sent on login.
pub const ORIGINATOR: &str = "xsprov";

/// Remote error codes callers match on.
pub mod codes {
    pub const HANDLE_INVALID: &str = "HANDLE_INVALID";
    pub const UUID_INVALID: &str = "UUID_INVALID";
    pub const VDI_IN_USE: &str = "VDI_IN_USE";
    pub const HOST_IS_SLAVE: &str = "HOST_IS_SLAVE";
    pub const SESSION_AUTHENTICATION_FAILED: &str = "SESSION_AUTHENTICATION_FAILED";
    pub const MESSAGE_METHOD_UNKNOWN: &str = "MESSAGE_METHOD_UNKNOWN";
}

/// Opaque handle to a remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueRef(String);

impl OpaqueRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn null() -> Self {
        Self(NULL_REF.to_string())
    }

    /// True for the NULL sentinel and for the empty string.
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == NULL_REF
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&OpaqueRef> for Value {
    fn from(r: &OpaqueRef) -> Self {
        Value::String(r.0.clone())
    }
}

/// Remote object classes, named the way the toolstack names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Pool,
    Host,
    HostMetrics,
    Sr,
    Pbd,
    Vdi,
    Vbd,
    Vif,
    Vm,
    VmGuestMetrics,
    Network,
    Pif,
    PifMetrics,
    Bond,
    Vlan,
    Tunnel,
    Pci,
    Blob,
    Secret,
    Task,
}

impl ObjectKind {
    /// Class name used as the method prefix.
    pub const fn class(self) -> &'static str {
        match self {
            ObjectKind::Pool => "pool",
            ObjectKind::Host => "host",
            ObjectKind::HostMetrics => "host_metrics",
            ObjectKind::Sr => "SR",
            ObjectKind::Pbd => "PBD",
            ObjectKind::Vdi => "VDI",
            ObjectKind::Vbd => "VBD",
            ObjectKind::Vif => "VIF",
            ObjectKind::Vm => "VM",
            ObjectKind::VmGuestMetrics => "VM_guest_metrics",
            ObjectKind::Network => "network",
            ObjectKind::Pif => "PIF",
            ObjectKind::PifMetrics => "PIF_metrics",
            ObjectKind::Bond => "Bond",
            ObjectKind::Vlan => "VLAN",
            ObjectKind::Tunnel => "tunnel",
            ObjectKind::Pci => "PCI",
            ObjectKind::Blob => "blob",
            ObjectKind::Secret => "secret",
            ObjectKind::Task => "task",
        }
    }

    /// Full method name for a message on this class.
    pub fn method(self, message: &str) -> String {
        format!("{}.{}", self.class(), message)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class())
    }
}

/// Failure reported by the toolstack: a machine-readable code plus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {params:?}")]
pub struct RemoteError {
    pub code: String,
    pub params: Vec<String>,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            code: code.into(),
            params,
        }
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

/// Errors surfaced by the gateway.
#[derive(Debug, Error)]
pub enum XapiError {
    #[error("{0}")]
    Remote(#[from] RemoteError),

    #[error("transport failure calling {method}: {reason}")]
    Transport { method: String, reason: String },

    #[error("malformed response to {method}: {reason}")]
    Decode { method: String, reason: String },
}

impl XapiError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            XapiError::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// True if this is a remote error carrying `code`.
    pub fn is_code(&self, code: &str) -> bool {
        self.remote().is_some_and(|e| e.is(code))
    }

    /// True if the object the call referred to no longer exists.
    pub fn is_gone(&self) -> bool {
        self.is_code(codes::HANDLE_INVALID) || self.is_code(codes::UUID_INVALID)
    }
}

/// Moves a method call to the toolstack and back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, XapiError>;
}

/// Opens authenticated sessions against a host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, username: &str, password: &str)
    -> Result<Session, XapiError>;
}

/// Authenticated session against one host.
#[derive(Clone)]
pub struct Session {
    transport: Arc<dyn Transport>,
    session_ref: OpaqueRef,
    base_url: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_ref", &self.session_ref)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, session_ref: OpaqueRef, base_url: String) -> Self {
        Self {
            transport,
            session_ref,
            base_url,
        }
    }

    /// Log in with a password and wrap the resulting session reference.
    pub async fn login(
        transport: Arc<dyn Transport>,
        base_url: String,
        username: &str,
        password: &str,
    ) -> Result<Self, XapiError> {
        let method = "session.login_with_password";
        let value = transport
            .call(
                method,
                vec![
                    json!(username),
                    json!(password),
                    json!(API_VERSION),
                    json!(ORIGINATOR),
                ],
            )
            .await?;
        let session_ref: OpaqueRef = decode(method, value)?;
        Ok(Self::new(transport, session_ref, base_url))
    }

    pub fn session_ref(&self) -> &OpaqueRef {
        &self.session_ref
    }

    /// URL of the host this session talks to, e.g. `https://10.0.0.1`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Call `method` with the session reference prepended to `args`.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, XapiError> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::from(&self.session_ref));
        params.extend(args);
        let value = self.transport.call(method, params).await?;
        decode(method, value)
    }

    /// Like [`Session::invoke`] for calls whose result is ignored.
    pub async fn invoke_unit(&self, method: &str, args: Vec<Value>) -> Result<(), XapiError> {
        self.invoke::<Value>(method, args).await.map(|_| ())
    }

    pub async fn get_record<T: DeserializeOwned>(
        &self,
        kind: ObjectKind,
        reference: &OpaqueRef,
    ) -> Result<T, XapiError> {
        self.invoke(&kind.method("get_record"), vec![reference.into()])
            .await
    }

    pub async fn get_all(&self, kind: ObjectKind) -> Result<Vec<OpaqueRef>, XapiError> {
        self.invoke(&kind.method("get_all"), vec![]).await
    }

    /// All records of a class, ordered by reference.
    pub async fn get_all_records<T: DeserializeOwned>(
        &self,
        kind: ObjectKind,
    ) -> Result<BTreeMap<OpaqueRef, T>, XapiError> {
        self.invoke(&kind.method("get_all_records"), vec![]).await
    }

    pub async fn get_by_uuid(&self, kind: ObjectKind, uuid: &str) -> Result<OpaqueRef, XapiError> {
        self.invoke(&kind.method("get_by_uuid"), vec![json!(uuid)])
            .await
    }

    pub async fn get_uuid(
        &self,
        kind: ObjectKind,
        reference: &OpaqueRef,
    ) -> Result<String, XapiError> {
        self.get_field(kind, reference, "uuid").await
    }

    pub async fn get_field<T: DeserializeOwned>(
        &self,
        kind: ObjectKind,
        reference: &OpaqueRef,
        field: &str,
    ) -> Result<T, XapiError> {
        self.invoke(&kind.method(&format!("get_{field}")), vec![reference.into()])
            .await
    }

    pub async fn set_field(
        &self,
        kind: ObjectKind,
        reference: &OpaqueRef,
        field: &str,
        value: Value,
    ) -> Result<(), XapiError> {
        self.invoke_unit(
            &kind.method(&format!("set_{field}")),
            vec![reference.into(), value],
        )
        .await
    }

    pub async fn create<R: Serialize + Sync>(
        &self,
        kind: ObjectKind,
        record: &R,
    ) -> Result<OpaqueRef, XapiError> {
        let method = kind.method("create");
        let record = serde_json::to_value(record).map_err(|e| XapiError::Decode {
            method: method.clone(),
            reason: e.to_string(),
        })?;
        self.invoke(&method, vec![record]).await
    }

    pub async fn destroy(&self, kind: ObjectKind, reference: &OpaqueRef) -> Result<(), XapiError> {
        self.invoke_unit(&kind.method("destroy"), vec![reference.into()])
            .await
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, XapiError> {
    serde_json::from_value(value).map_err(|e| XapiError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Turn a configured host into a URL, defaulting to https.
pub fn host_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Bare address of a host, with any scheme and trailing slash removed.
pub fn host_address(host: &str) -> &str {
    let host = host.trim();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    host.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_ref_detection() {
        assert!(OpaqueRef::null().is_null());
        assert!(OpaqueRef::new("").is_null());
        assert!(!OpaqueRef::new("OpaqueRef:1234").is_null());
    }

    #[test]
    fn method_names_use_toolstack_classes() {
        assert_eq!(ObjectKind::Vm.method("get_record"), "VM.get_record");
        assert_eq!(ObjectKind::HostMetrics.method("get_live"), "host_metrics.get_live");
        assert_eq!(ObjectKind::Network.method("create"), "network.create");
    }

    #[test]
    fn host_url_and_address() {
        assert_eq!(host_url("10.0.0.1"), "https://10.0.0.1");
        assert_eq!(host_url("http://10.0.0.1/"), "http://10.0.0.1");
        assert_eq!(host_address("https://10.0.0.1/"), "10.0.0.1");
        assert_eq!(host_address("xs1.lab"), "xs1.lab");
    }

    #[test]
    fn gone_errors() {
        let err = XapiError::from(RemoteError::new(codes::HANDLE_INVALID, vec![]));
        assert!(err.is_gone());
        let err = XapiError::from(RemoteError::new(codes::VDI_IN_USE, vec![]));
        assert!(!err.is_gone());
        assert!(err.is_code(codes::VDI_IN_USE));
    }
}
