//! Reconcilers for the declared resource kinds.
//!
//! Each reconciler turns a declared configuration into remote calls and reads
//! the remote objects back into a state of the same shape. `update` always
//! validates the whole change before its first remote mutation.

pub mod network;
pub mod pif;
pub mod pool;
pub mod snapshot;
pub mod sr;
pub mod vbd;
pub mod vdi;
pub mod vif;
pub mod vm;

use async_trait::async_trait;

use crate::config::ProviderContext;
use crate::error::{ProviderError, Result};
use crate::xapi::XapiError;

/// Lifecycle of one resource kind.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Declared attributes.
    type Config: Send + Sync;
    /// Declared attributes plus computed ones, as last read back.
    type State: Send + Sync;

    async fn create(&self, ctx: &ProviderContext, config: &Self::Config) -> Result<Self::State>;

    /// Refresh `state` from the remote objects.
    async fn read(&self, ctx: &ProviderContext, state: &Self::State) -> Result<Self::State>;

    async fn update(
        &self,
        ctx: &ProviderContext,
        config: &Self::Config,
        state: &Self::State,
    ) -> Result<Self::State>;

    async fn delete(&self, ctx: &ProviderContext, state: &Self::State) -> Result<()>;
}

/// Fail with an immutability error when `field` changed.
pub(crate) fn ensure_unchanged<T: PartialEq + ?Sized>(
    resource: &'static str,
    field: &str,
    planned: &T,
    current: &T,
) -> Result<()> {
    if planned == current {
        Ok(())
    } else {
        Err(ProviderError::immutable(resource, field))
    }
}

/// Treat "object already gone" as success, for teardown paths.
pub(crate) fn ignore_gone<T: Default>(
    result: std::result::Result<T, XapiError>,
) -> std::result::Result<T, XapiError> {
    match result {
        Err(e) if e.is_gone() => Ok(T::default()),
        other => other,
    }
}

/// `"<key>"` attribute names for nested blocks, e.g. `hard_drive[<uuid>].mode`.
pub(crate) fn nested(block: &str, key: &str, field: &str) -> String {
    format!("{block}[{key}].{field}")
}
