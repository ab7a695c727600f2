//! Network interfaces of a VM, keyed by device slot.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::nested;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::resolve::{ref_of, uuid_of};
use crate::xapi::records::{StringMap, VifRecord, VmRecord};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

/// A declared network interface. `device` defaults to the position in the
/// declaration, `mac` and `mtu` to what the toolstack picks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub network_uuid: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub mtu: Option<i64>,
    #[serde(default)]
    pub other_config: StringMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceState {
    pub network_uuid: String,
    pub device: String,
    pub mac: String,
    pub mtu: i64,
    pub other_config: StringMap,
    pub vif_ref: OpaqueRef,
    #[serde(default)]
    pub attached: bool,
}

/// Declared interfaces with their device slots resolved.
pub fn keyed(desired: &[NetworkInterface]) -> Vec<(String, &NetworkInterface)> {
    desired
        .iter()
        .enumerate()
        .map(|(i, iface)| (iface.device.clone().unwrap_or_else(|| i.to_string()), iface))
        .collect()
}

/// Reject duplicate device slots.
pub fn check_unique(desired: &[NetworkInterface]) -> Result<()> {
    let keys = keyed(desired);
    for (i, (device, _)) in keys.iter().enumerate() {
        if keys[..i].iter().any(|(d, _)| d == device) {
            return Err(ProviderError::invalid(
                "network_interface",
                device,
                "device slot is used twice",
            ));
        }
    }
    Ok(())
}

/// MAC and MTU are fixed once the interface exists.
pub fn check_immutable(desired: &[NetworkInterface], current: &[NetworkInterfaceState]) -> Result<()> {
    for (device, iface) in keyed(desired) {
        let Some(existing) = current.iter().find(|c| c.device == device) else {
            continue;
        };
        if let Some(mac) = &iface.mac
            && !mac.eq_ignore_ascii_case(&existing.mac)
        {
            return Err(ProviderError::immutable(
                "VM",
                nested("network_interface", &device, "mac"),
            ));
        }
        if let Some(mtu) = iface.mtu
            && mtu != existing.mtu
        {
            return Err(ProviderError::immutable(
                "VM",
                nested("network_interface", &device, "mtu"),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct VifDiff<'a> {
    pub create: Vec<(String, &'a NetworkInterface)>,
    pub destroy: Vec<&'a NetworkInterfaceState>,
    pub update: Vec<(&'a NetworkInterface, &'a NetworkInterfaceState)>,
}

pub fn diff_vifs<'a>(
    desired: &'a [NetworkInterface],
    current: &'a [NetworkInterfaceState],
) -> VifDiff<'a> {
    let keys = keyed(desired);
    let mut diff = VifDiff::default();
    for (device, iface) in &keys {
        match current.iter().find(|c| &c.device == device) {
            None => diff.create.push((device.clone(), *iface)),
            Some(existing) => {
                if existing.network_uuid != iface.network_uuid
                    || existing.other_config != iface.other_config
                {
                    diff.update.push((*iface, existing));
                }
            }
        }
    }
    diff.destroy = current
        .iter()
        .filter(|c| !keys.iter().any(|(d, _)| *d == c.device))
        .collect();
    diff
}

pub async fn interfaces(session: &Session, vm: &VmRecord) -> Result<Vec<NetworkInterfaceState>> {
    let mut states = Vec::with_capacity(vm.vifs.len());
    for vif in &vm.vifs {
        let record: VifRecord = session
            .get_record(ObjectKind::Vif, vif)
            .await
            .remote("VIF.get_record", vif)?;
        states.push(NetworkInterfaceState {
            network_uuid: uuid_of(session, ObjectKind::Network, &record.network).await?,
            device: record.device,
            mac: record.mac,
            mtu: record.mtu,
            other_config: record.other_config,
            vif_ref: vif.clone(),
            attached: record.currently_attached,
        });
    }
    states.sort_by(|a, b| a.device.cmp(&b.device));
    Ok(states)
}

pub async fn create_vif(
    session: &Session,
    vm: &OpaqueRef,
    device: &str,
    iface: &NetworkInterface,
    running: bool,
) -> Result<OpaqueRef> {
    let network = ref_of(session, ObjectKind::Network, &iface.network_uuid).await?;
    let mtu = match iface.mtu {
        Some(mtu) => mtu,
        None => session
            .get_field(ObjectKind::Network, &network, "MTU")
            .await
            .remote("network.get_MTU", &iface.network_uuid)?,
    };
    let record = VifRecord {
        device: device.to_string(),
        network,
        vm: vm.clone(),
        mac: iface.mac.clone().unwrap_or_default(),
        mtu,
        other_config: iface.other_config.clone(),
        locking_mode: "network_default".to_string(),
        ..Default::default()
    };
    let vif = session
        .create(ObjectKind::Vif, &record)
        .await
        .remote("VIF.create", &iface.network_uuid)?;
    debug!(vif = %vif, device, network = %iface.network_uuid, "created VIF");
    if running {
        session
            .invoke_unit("VIF.plug", vec![(&vif).into()])
            .await
            .remote("VIF.plug", &vif)?;
    }
    Ok(vif)
}

pub async fn update_vif(
    session: &Session,
    iface: &NetworkInterface,
    current: &NetworkInterfaceState,
) -> Result<()> {
    let vif = &current.vif_ref;
    if iface.network_uuid != current.network_uuid {
        let network = ref_of(session, ObjectKind::Network, &iface.network_uuid).await?;
        session
            .invoke_unit("VIF.move", vec![vif.into(), (&network).into()])
            .await
            .remote("VIF.move", vif)?;
    }
    if iface.other_config != current.other_config {
        session
            .set_field(ObjectKind::Vif, vif, "other_config", json!(iface.other_config))
            .await
            .remote("VIF.set_other_config", vif)?;
    }
    Ok(())
}

pub async fn destroy_vif(session: &Session, vif: &OpaqueRef, attached: bool) -> Result<()> {
    if attached {
        session
            .invoke_unit("VIF.unplug", vec![vif.into()])
            .await
            .remote("VIF.unplug", vif)?;
    }
    session
        .destroy(ObjectKind::Vif, vif)
        .await
        .remote("VIF.destroy", vif)?;
    debug!(vif = %vif, "destroyed VIF");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeXapi;

    fn iface(network: &str) -> NetworkInterface {
        NetworkInterface {
            network_uuid: network.to_string(),
            device: None,
            mac: None,
            mtu: None,
            other_config: StringMap::new(),
        }
    }

    fn state(device: &str, network: &str, mac: &str) -> NetworkInterfaceState {
        NetworkInterfaceState {
            network_uuid: network.to_string(),
            device: device.to_string(),
            mac: mac.to_string(),
            mtu: 1500,
            other_config: StringMap::new(),
            vif_ref: OpaqueRef::new(format!("OpaqueRef:vif-{device}")),
            attached: false,
        }
    }

    #[test]
    fn devices_default_to_declaration_order() {
        let desired = [iface("lan"), NetworkInterface { device: Some("4".into()), ..iface("dmz") }];
        let devices: Vec<String> = keyed(&desired).into_iter().map(|(d, _)| d).collect();
        assert_eq!(devices, vec!["0", "4"]);
        assert!(check_unique(&[iface("a"), NetworkInterface { device: Some("0".into()), ..iface("b") }]).is_err());
    }

    #[test]
    fn mac_change_is_rejected_with_the_device() {
        let current = [state("0", "lan", "aa:bb:cc:dd:ee:01")];
        let same = [NetworkInterface { mac: Some("AA:BB:CC:DD:EE:01".into()), ..iface("lan") }];
        check_immutable(&same, &current).unwrap();

        let changed = [NetworkInterface { mac: Some("aa:bb:cc:dd:ee:02".into()), ..iface("lan") }];
        let err = check_immutable(&changed, &current).unwrap_err();
        assert_eq!(err.attribute(), Some("network_interface[0].mac"));

        let mtu = [NetworkInterface { mtu: Some(9000), ..iface("lan") }];
        let err = check_immutable(&mtu, &current).unwrap_err();
        assert_eq!(err.attribute(), Some("network_interface[0].mtu"));
    }

    #[test]
    fn diff_moves_instead_of_recreating() {
        let current = [state("0", "lan", "m0"), state("1", "dmz", "m1")];
        let desired = [iface("storage"), NetworkInterface { device: Some("2".into()), ..iface("dmz") }];
        let diff = diff_vifs(&desired, &current);
        assert_eq!(diff.create.len(), 1);
        assert_eq!(diff.create[0].0, "2");
        assert_eq!(diff.destroy, vec![&current[1]]);
        assert_eq!(diff.update.len(), 1);
        assert_eq!(diff.update[0].1.device, "0");
    }

    #[tokio::test]
    async fn vif_inherits_network_mtu_and_plugs_on_running_vm() {
        let fake = FakeXapi::new();
        let vm = fake.insert(ObjectKind::Vm, json!({"power_state": "Running"}));
        fake.insert(ObjectKind::Network, json!({"uuid": "jumbo", "MTU": 9000}));
        let session = fake.session();

        let vif = create_vif(&session, &vm, "0", &iface("jumbo"), true).await.unwrap();
        let record = fake.record(ObjectKind::Vif, &vif).unwrap();
        assert_eq!(record["MTU"], 9000);
        assert_eq!(record["currently_attached"], true);
        assert_eq!(fake.mutations(), vec!["VIF.create", "VIF.plug"]);
    }
}
