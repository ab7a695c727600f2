//! XenServer provider core.
//!
//! Reconcilers map declared pool, VM, storage and network resources onto
//! XenAPI objects over JSON-RPC, and import local disk images into VDIs.

pub mod config;
pub mod error;
pub mod import;
pub mod lookup;
pub mod other_config;
pub mod reconciler;
pub mod resolve;
pub mod retry;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
pub mod xapi;

pub use config::{ProviderConfig, ProviderContext};
pub use error::{ProviderError, Result};
pub use reconciler::Reconciler;
