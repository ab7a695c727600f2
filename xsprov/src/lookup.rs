//! Read-only lookups of existing pool objects.
//!
//! Every lookup fetches all records of one class, keeps the ones matching
//! each filter field that is set, and returns them sorted by UUID with
//! references resolved to UUIDs.

use std::collections::BTreeMap;

use clap::Args;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RemoteContext, Result};
use crate::resolve::{find_ref, uuid_of, uuids_of};
use crate::xapi::records::{
    HostRecord, IpConfigurationMode, NetworkRecord, PifRecord, PowerState, SrRecord, StringMap,
    VmRecord,
};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

fn matches(filter: &Option<String>, value: &str) -> bool {
    filter.as_deref().is_none_or(|wanted| wanted == value)
}

async fn all_records<T: DeserializeOwned>(
    session: &Session,
    kind: ObjectKind,
) -> Result<BTreeMap<OpaqueRef, T>> {
    session
        .get_all_records(kind)
        .await
        .remote(&kind.method("get_all_records"), "pool")
}

/// Match on name and UUID.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFilter {
    #[arg(long)]
    pub name_label: Option<String>,
    #[arg(long)]
    pub uuid: Option<String>,
}

impl NameFilter {
    fn matches(&self, name_label: &str, uuid: &str) -> bool {
        matches(&self.name_label, name_label) && matches(&self.uuid, uuid)
    }
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    #[command(flatten)]
    pub name: NameFilter,
    /// Management address
    #[arg(long)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostItem {
    pub uuid: String,
    pub name_label: String,
    pub address: String,
    pub enabled: bool,
    pub pifs: Vec<String>,
}

pub async fn hosts(session: &Session, filter: &HostFilter) -> Result<Vec<HostItem>> {
    let mut items = Vec::new();
    for host in all_records::<HostRecord>(session, ObjectKind::Host).await?.into_values() {
        if !filter.name.matches(&host.name_label, &host.uuid) || !matches(&filter.address, &host.address) {
            continue;
        }
        items.push(HostItem {
            pifs: uuids_of(session, ObjectKind::Pif, &host.pifs).await?,
            uuid: host.uuid,
            name_label: host.name_label,
            address: host.address,
            enabled: host.enabled,
        });
    }
    items.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(items)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SrItem {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    pub content_type: String,
    pub shared: bool,
    pub physical_size: i64,
    pub pbds: Vec<String>,
    pub sm_config: StringMap,
    pub other_config: StringMap,
}

pub async fn srs(session: &Session, filter: &NameFilter) -> Result<Vec<SrItem>> {
    let mut items = Vec::new();
    for sr in all_records::<SrRecord>(session, ObjectKind::Sr).await?.into_values() {
        if !filter.matches(&sr.name_label, &sr.uuid) {
            continue;
        }
        items.push(SrItem {
            pbds: uuids_of(session, ObjectKind::Pbd, &sr.pbds).await?,
            uuid: sr.uuid,
            name_label: sr.name_label,
            name_description: sr.name_description,
            sr_type: sr.sr_type,
            content_type: sr.content_type,
            shared: sr.shared,
            physical_size: sr.physical_size,
            sm_config: sr.sm_config,
            other_config: sr.other_config,
        });
    }
    items.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(items)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkItem {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub mtu: i64,
    pub managed: bool,
    pub bridge: String,
    pub tags: Vec<String>,
    pub pifs: Vec<String>,
    pub other_config: StringMap,
}

pub async fn networks(session: &Session, filter: &NameFilter) -> Result<Vec<NetworkItem>> {
    let mut items = Vec::new();
    for network in all_records::<NetworkRecord>(session, ObjectKind::Network)
        .await?
        .into_values()
    {
        if !filter.matches(&network.name_label, &network.uuid) {
            continue;
        }
        items.push(NetworkItem {
            pifs: uuids_of(session, ObjectKind::Pif, &network.pifs).await?,
            uuid: network.uuid,
            name_label: network.name_label,
            name_description: network.name_description,
            mtu: network.mtu,
            managed: network.managed,
            bridge: network.bridge,
            tags: network.tags,
            other_config: network.other_config,
        });
    }
    items.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(items)
}

/// VMs, templates and snapshots alike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmItem {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub power_state: PowerState,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
    pub memory_static_max: i64,
    pub vcpus_max: i64,
    pub vcpus_at_startup: i64,
    /// Host UUID, empty while halted.
    pub resident_on: String,
    pub other_config: StringMap,
}

pub async fn vms(session: &Session, filter: &NameFilter) -> Result<Vec<VmItem>> {
    let mut items = Vec::new();
    for vm in all_records::<VmRecord>(session, ObjectKind::Vm).await?.into_values() {
        if !filter.matches(&vm.name_label, &vm.uuid) {
            continue;
        }
        items.push(VmItem {
            resident_on: uuid_of(session, ObjectKind::Host, &vm.resident_on).await?,
            uuid: vm.uuid,
            name_label: vm.name_label,
            name_description: vm.name_description,
            power_state: vm.power_state,
            is_a_template: vm.is_a_template,
            is_a_snapshot: vm.is_a_snapshot,
            memory_static_max: vm.memory_static_max,
            vcpus_max: vm.vcpus_max,
            vcpus_at_startup: vm.vcpus_at_startup,
            other_config: vm.other_config,
        });
    }
    items.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(items)
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct PifFilter {
    /// Device name, e.g. eth0
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long)]
    pub management: Option<bool>,
    /// UUID of the attached network
    #[arg(long)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PifItem {
    pub uuid: String,
    pub device: String,
    pub host: String,
    pub network: String,
    pub mac: String,
    pub mtu: i64,
    pub physical: bool,
    pub management: bool,
    pub vlan: i64,
    pub ip_configuration_mode: IpConfigurationMode,
    pub ip: String,
    pub disallow_unplug: bool,
    pub other_config: StringMap,
}

/// PIFs across the pool. A network filter naming no network matches nothing.
pub async fn pifs(session: &Session, filter: &PifFilter) -> Result<Vec<PifItem>> {
    let network = match filter.network.as_deref() {
        Some(uuid) => match find_ref(session, ObjectKind::Network, uuid).await? {
            Some(network) => Some(network),
            None => return Ok(Vec::new()),
        },
        None => None,
    };

    let mut items = Vec::new();
    for pif in all_records::<PifRecord>(session, ObjectKind::Pif).await?.into_values() {
        if network.as_ref().is_some_and(|n| *n != pif.network)
            || !matches(&filter.device, &pif.device)
            || filter.management.is_some_and(|m| m != pif.management)
        {
            continue;
        }
        items.push(PifItem {
            host: uuid_of(session, ObjectKind::Host, &pif.host).await?,
            network: uuid_of(session, ObjectKind::Network, &pif.network).await?,
            uuid: pif.uuid,
            device: pif.device,
            mac: pif.mac,
            mtu: pif.mtu,
            physical: pif.physical,
            management: pif.management,
            vlan: pif.vlan,
            ip_configuration_mode: pif.ip_configuration_mode,
            ip: pif.ip,
            disallow_unplug: pif.disallow_unplug,
            other_config: pif.other_config,
        });
    }
    items.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(items)
}
