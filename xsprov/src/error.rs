//! Provider error types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::xapi::{ObjectKind, XapiError};

/// Errors returned by reconcilers and the import pipeline.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A field that is fixed at creation time was changed.
    #[error("\"{field}\" can not be updated once the {resource} exists")]
    ImmutableField {
        resource: &'static str,
        field: String,
    },

    /// A field value failed validation.
    #[error("invalid \"{field}\" value {value:?}: {reason}")]
    InvalidField {
        field: String,
        value: String,
        reason: String,
    },

    /// The same host was asked to both join and leave the pool.
    #[error("host {address} with uuid {uuid} is in eject_supporters, can't join the pool")]
    JoinEjectConflict { address: String, uuid: String },

    /// A join candidate belongs to another pool or is itself a pool.
    #[error("supporter host {address} is not a standalone host: {reason}")]
    NotStandaloneHost { address: String, reason: String },

    #[error("{vcpus} cores could not fit to {cores_per_socket} cores-per-socket topology")]
    CoresPerSocketMismatch { vcpus: u32, cores_per_socket: u32 },

    #[error("SR with uuid {uuid} is non-shared SR")]
    NonSharedDefaultSr { uuid: String },

    #[error("unable to find the VM template with the name: {0}")]
    TemplateNotFound(String),

    #[error("VM template name {name:?} is ambiguous: {count} templates match")]
    AmbiguousTemplate { name: String, count: usize },

    /// A hardware change the toolstack refuses on a running VM.
    #[error("unable to change {what} of VM {vm} while it is running")]
    VmRunning { vm: String, what: &'static str },

    /// A pool member has not reported itself live yet.
    #[error("host {host} is not live yet")]
    NotLive { host: String },

    /// A lookup by name or device found nothing usable.
    #[error("{what} not found: {detail}")]
    NotFound { what: &'static str, detail: String },

    /// A remote call failed; `target` names the object involved.
    #[error("{op} failed for {target}: {source}")]
    Remote {
        op: String,
        target: String,
        #[source]
        source: XapiError,
    },

    #[error("unable to resolve UUID of {kind} {reference}: {source}")]
    Resolve {
        kind: ObjectKind,
        reference: String,
        #[source]
        source: XapiError,
    },

    /// A bounded wait expired.
    #[error("timed out after {}s waiting for {wait}{}", .after.as_secs(), last_error_suffix(.last_error))]
    Timeout {
        wait: String,
        after: Duration,
        last_error: Option<String>,
    },

    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    #[error("remote task {task} failed: {detail}")]
    TaskFailed { task: String, detail: String },

    #[error("upload of {} rejected with HTTP {status}: {body}", .path.display())]
    UploadRejected {
        path: PathBuf,
        status: u16,
        body: String,
    },

    #[error("upload of {} failed: {reason}", .path.display())]
    Upload { path: PathBuf, reason: String },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A compensating cleanup failed after an earlier failure.
    #[error("{original}; cleanup also failed: {cleanup}")]
    CleanupFailed {
        original: Box<ProviderError>,
        cleanup: Box<ProviderError>,
    },

    #[error("missing provider configuration \"{0}\"")]
    MissingConfig(&'static str),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

impl ProviderError {
    pub fn immutable(resource: &'static str, field: impl Into<String>) -> Self {
        ProviderError::ImmutableField {
            resource,
            field: field.into(),
        }
    }

    pub fn invalid(
        field: impl Into<String>,
        value: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        ProviderError::InvalidField {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn cleanup_failed(original: ProviderError, cleanup: ProviderError) -> Self {
        ProviderError::CleanupFailed {
            original: Box::new(original),
            cleanup: Box::new(cleanup),
        }
    }

    /// Configuration attribute the error is about, if any.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            ProviderError::ImmutableField { field, .. } => Some(field.as_str()),
            ProviderError::InvalidField { field, .. } => Some(field.as_str()),
            ProviderError::JoinEjectConflict { .. } => Some("eject_supporters"),
            ProviderError::NotStandaloneHost { .. } => Some("join_supporters"),
            ProviderError::CoresPerSocketMismatch { .. } => Some("cores_per_socket"),
            ProviderError::NonSharedDefaultSr { .. } => Some("default_sr"),
            ProviderError::TemplateNotFound(_) | ProviderError::AmbiguousTemplate { .. } => {
                Some("template_name")
            }
            ProviderError::MissingConfig(name) => Some(*name),
            ProviderError::CleanupFailed { original, .. } => original.attribute(),
            _ => None,
        }
    }

    /// True for errors detected before any remote mutation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ProviderError::ImmutableField { .. }
                | ProviderError::InvalidField { .. }
                | ProviderError::JoinEjectConflict { .. }
                | ProviderError::NotStandaloneHost { .. }
                | ProviderError::CoresPerSocketMismatch { .. }
                | ProviderError::NonSharedDefaultSr { .. }
                | ProviderError::TemplateNotFound(_)
                | ProviderError::AmbiguousTemplate { .. }
                | ProviderError::VmRunning { .. }
                | ProviderError::MissingConfig(_)
        )
    }

    /// The underlying gateway error, if this wraps one.
    pub fn xapi(&self) -> Option<&XapiError> {
        match self {
            ProviderError::Remote { source, .. } | ProviderError::Resolve { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Result type for provider operations.
pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

/// Attach operation and target context to gateway results.
pub trait RemoteContext<T> {
    fn remote(self, op: &str, target: impl fmt::Display) -> Result<T>;
}

impl<T> RemoteContext<T> for std::result::Result<T, XapiError> {
    fn remote(self, op: &str, target: impl fmt::Display) -> Result<T> {
        self.map_err(|source| ProviderError::Remote {
            op: op.to_string(),
            target: target.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xapi::RemoteError;

    #[test]
    fn cores_per_socket_message_names_both_values() {
        let err = ProviderError::CoresPerSocketMismatch {
            vcpus: 3,
            cores_per_socket: 2,
        };
        assert_eq!(
            err.to_string(),
            "3 cores could not fit to 2 cores-per-socket topology"
        );
        assert_eq!(err.attribute(), Some("cores_per_socket"));
        assert!(err.is_validation());
    }

    #[test]
    fn timeout_names_wait_and_duration() {
        let err = ProviderError::Timeout {
            wait: "guest IP of VM 42".into(),
            after: Duration::from_secs(90),
            last_error: None,
        };
        assert_eq!(err.to_string(), "timed out after 90s waiting for guest IP of VM 42");
    }

    #[test]
    fn cleanup_failure_reports_both_errors() {
        let original = ProviderError::NotFound {
            what: "ISO",
            detail: "debian.iso".into(),
        };
        let cleanup: Result<()> = Err(XapiError::from(RemoteError::new("VDI_IN_USE", vec![])))
            .remote("VDI.destroy", "OpaqueRef:7");
        let err = ProviderError::cleanup_failed(original, cleanup.unwrap_err());
        let msg = err.to_string();
        assert!(msg.contains("debian.iso"));
        assert!(msg.contains("VDI_IN_USE"));
        assert!(msg.contains("OpaqueRef:7"));
    }
}
