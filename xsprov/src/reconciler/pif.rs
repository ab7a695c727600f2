//! Configuration of an existing physical interface.
//!
//! Nothing is created or destroyed: create and update both apply the declared
//! settings, and delete leaves the interface as it is.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use super::Reconciler;
use super::vm::is_routable;
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::resolve::ref_of;
use crate::retry::pause;
use crate::xapi::records::{IpConfigurationMode, StringMap};
use crate::xapi::{ObjectKind, OpaqueRef};

const MANAGEMENT_PURPOSE: &str = "management_purpose";

/// IPv4 settings for the interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Stored as the interface's management purpose.
    #[serde(default)]
    pub name_label: Option<String>,
    pub mode: IpConfigurationMode,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub netmask: String,
    /// Comma separated DNS servers.
    #[serde(default)]
    pub dns: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PifConfigureConfig {
    pub uuid: String,
    #[serde(default)]
    pub disallow_unplug: Option<bool>,
    #[serde(default)]
    pub interface: Option<InterfaceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PifConfigureState {
    pub uuid: String,
    #[serde(default)]
    pub disallow_unplug: Option<bool>,
    #[serde(default)]
    pub interface: Option<InterfaceConfig>,
    /// Address currently reported by the interface.
    #[serde(default)]
    pub ip: String,
}

fn validate(config: &PifConfigureConfig) -> Result<()> {
    let Some(interface) = &config.interface else {
        return Ok(());
    };
    if interface.mode != IpConfigurationMode::Static {
        return Ok(());
    }
    for (field, value) in [("interface.ip", &interface.ip), ("interface.netmask", &interface.netmask)] {
        if value.parse::<IpAddr>().is_err() {
            return Err(ProviderError::invalid(field, value, "static mode needs an IPv4 address"));
        }
    }
    if !interface.gateway.is_empty() && interface.gateway.parse::<IpAddr>().is_err() {
        return Err(ProviderError::invalid("interface.gateway", &interface.gateway, "not an IP address"));
    }
    Ok(())
}

/// Applies [`PifConfigureConfig`] to an interface.
#[derive(Debug, Clone)]
pub struct PifConfigureReconciler {
    /// How long a DHCP interface may take to obtain an address.
    pub dhcp_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PifConfigureReconciler {
    fn default() -> Self {
        Self {
            dhcp_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl PifConfigureReconciler {
    async fn apply(&self, ctx: &ProviderContext, config: &PifConfigureConfig) -> Result<PifConfigureState> {
        validate(config)?;
        let session = &ctx.session;
        let pif = ref_of(session, ObjectKind::Pif, &config.uuid).await?;

        if let Some(disallow) = config.disallow_unplug {
            session
                .set_field(ObjectKind::Pif, &pif, "disallow_unplug", json!(disallow))
                .await
                .remote("PIF.set_disallow_unplug", &config.uuid)?;
        }

        if let Some(interface) = &config.interface {
            self.configure_interface(ctx, &pif, &config.uuid, interface).await?;
        }

        let ip: String = session
            .get_field(ObjectKind::Pif, &pif, "IP")
            .await
            .remote("PIF.get_IP", &config.uuid)?;
        Ok(PifConfigureState {
            uuid: config.uuid.clone(),
            disallow_unplug: config.disallow_unplug,
            interface: config.interface.clone(),
            ip,
        })
    }

    async fn configure_interface(
        &self,
        ctx: &ProviderContext,
        pif: &OpaqueRef,
        uuid: &str,
        interface: &InterfaceConfig,
    ) -> Result<()> {
        let session = &ctx.session;
        let metrics: OpaqueRef = session
            .get_field(ObjectKind::Pif, pif, "metrics")
            .await
            .remote("PIF.get_metrics", uuid)?;
        let carrier: bool = session
            .get_field(ObjectKind::PifMetrics, &metrics, "carrier")
            .await
            .remote("PIF_metrics.get_carrier", uuid)?;
        if !carrier {
            return Err(ProviderError::NotFound {
                what: "carrier",
                detail: format!("PIF {uuid} is not connected"),
            });
        }

        if let Some(name) = &interface.name_label {
            let mut other_config: StringMap = session
                .get_field(ObjectKind::Pif, pif, "other_config")
                .await
                .remote("PIF.get_other_config", uuid)?;
            other_config.insert(MANAGEMENT_PURPOSE.to_string(), name.clone());
            session
                .set_field(ObjectKind::Pif, pif, "other_config", json!(other_config))
                .await
                .remote("PIF.set_other_config", uuid)?;
        }

        debug!(
            pif = %uuid,
            mode = ?interface.mode,
            ip = %interface.ip,
            netmask = %interface.netmask,
            gateway = %interface.gateway,
            dns = %interface.dns,
            "reconfiguring PIF IP"
        );
        session
            .invoke_unit(
                "PIF.reconfigure_ip",
                vec![
                    pif.into(),
                    json!(interface.mode),
                    json!(interface.ip),
                    json!(interface.netmask),
                    json!(interface.gateway),
                    json!(interface.dns),
                ],
            )
            .await
            .remote("PIF.reconfigure_ip", uuid)?;

        if interface.mode == IpConfigurationMode::Dhcp {
            let ip = self.wait_for_lease(ctx, pif, uuid).await?;
            info!(pif = %uuid, ip = %ip, "PIF obtained a DHCP address");
        }
        Ok(())
    }

    async fn wait_for_lease(&self, ctx: &ProviderContext, pif: &OpaqueRef, uuid: &str) -> Result<IpAddr> {
        let deadline = Instant::now() + self.dhcp_timeout;
        loop {
            let ip: String = ctx
                .session
                .get_field(ObjectKind::Pif, pif, "IP")
                .await
                .remote("PIF.get_IP", uuid)?;
            if let Ok(ip) = ip.parse::<IpAddr>()
                && is_routable(&ip)
            {
                return Ok(ip);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProviderError::Timeout {
                    wait: format!("a DHCP address on PIF {uuid}, check that the interface is connected"),
                    after: self.dhcp_timeout,
                    last_error: None,
                });
            }
            pause(&ctx.cancel, self.poll_interval.min(deadline - now), "PIF DHCP address").await?;
        }
    }
}

#[async_trait]
impl Reconciler for PifConfigureReconciler {
    type Config = PifConfigureConfig;
    type State = PifConfigureState;

    async fn create(&self, ctx: &ProviderContext, config: &PifConfigureConfig) -> Result<PifConfigureState> {
        self.apply(ctx, config).await
    }

    async fn read(&self, ctx: &ProviderContext, state: &PifConfigureState) -> Result<PifConfigureState> {
        let session = &ctx.session;
        let pif = ref_of(session, ObjectKind::Pif, &state.uuid).await?;
        let ip: String = session
            .get_field(ObjectKind::Pif, &pif, "IP")
            .await
            .remote("PIF.get_IP", &state.uuid)?;
        Ok(PifConfigureState {
            ip,
            ..state.clone()
        })
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        config: &PifConfigureConfig,
        _state: &PifConfigureState,
    ) -> Result<PifConfigureState> {
        self.apply(ctx, config).await
    }

    async fn delete(&self, _ctx: &ProviderContext, state: &PifConfigureState) -> Result<()> {
        debug!(pif = %state.uuid, "leaving PIF configuration in place");
        Ok(())
    }
}
