//! Typed views of remote object records.
//!
//! Only the fields the reconcilers read or write are modelled; everything is
//! defaulted so partial records decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::OpaqueRef;

pub type StringMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    Halted,
    Paused,
    Running,
    Suspended,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VbdType {
    #[default]
    Disk,
    #[serde(rename = "CD")]
    Cd,
    Floppy,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VbdMode {
    #[serde(rename = "RO")]
    ReadOnly,
    #[default]
    #[serde(rename = "RW")]
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpConfigurationMode {
    #[default]
    #[serde(rename = "None")]
    Unconfigured,
    #[serde(rename = "DHCP")]
    Dhcp,
    Static,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub power_state: PowerState,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
    pub snapshot_of: OpaqueRef,
    pub memory_static_min: i64,
    pub memory_static_max: i64,
    pub memory_dynamic_min: i64,
    pub memory_dynamic_max: i64,
    #[serde(rename = "VCPUs_max")]
    pub vcpus_max: i64,
    #[serde(rename = "VCPUs_at_startup")]
    pub vcpus_at_startup: i64,
    pub platform: StringMap,
    #[serde(rename = "HVM_boot_params")]
    pub hvm_boot_params: StringMap,
    pub other_config: StringMap,
    #[serde(rename = "VBDs")]
    pub vbds: Vec<OpaqueRef>,
    #[serde(rename = "VIFs")]
    pub vifs: Vec<OpaqueRef>,
    pub guest_metrics: OpaqueRef,
    pub resident_on: OpaqueRef,
    #[serde(rename = "suspend_SR")]
    pub suspend_sr: OpaqueRef,
    pub snapshot_info: StringMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VbdRecord {
    pub uuid: String,
    #[serde(rename = "VM")]
    pub vm: OpaqueRef,
    #[serde(rename = "VDI")]
    pub vdi: OpaqueRef,
    #[serde(rename = "type")]
    pub vbd_type: VbdType,
    pub mode: VbdMode,
    pub bootable: bool,
    pub empty: bool,
    pub userdevice: String,
    pub device: String,
    pub unpluggable: bool,
    pub currently_attached: bool,
    pub other_config: StringMap,
    pub qos_algorithm_type: String,
    pub qos_algorithm_params: StringMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VdiRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "SR")]
    pub sr: OpaqueRef,
    pub virtual_size: i64,
    #[serde(rename = "type")]
    pub vdi_type: String,
    pub sharable: bool,
    pub read_only: bool,
    pub other_config: StringMap,
    pub sm_config: StringMap,
    pub xenstore_data: StringMap,
    pub tags: Vec<String>,
    #[serde(rename = "VBDs")]
    pub vbds: Vec<OpaqueRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VifRecord {
    pub uuid: String,
    pub device: String,
    pub network: OpaqueRef,
    #[serde(rename = "VM")]
    pub vm: OpaqueRef,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "MTU")]
    pub mtu: i64,
    pub other_config: StringMap,
    pub qos_algorithm_type: String,
    pub qos_algorithm_params: StringMap,
    pub locking_mode: String,
    pub currently_attached: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostRecord {
    pub uuid: String,
    pub name_label: String,
    pub address: String,
    pub enabled: bool,
    pub metrics: OpaqueRef,
    #[serde(rename = "PIFs")]
    pub pifs: Vec<OpaqueRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub master: OpaqueRef,
    #[serde(rename = "default_SR")]
    pub default_sr: OpaqueRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SrRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    pub content_type: String,
    pub shared: bool,
    pub sm_config: StringMap,
    pub other_config: StringMap,
    #[serde(rename = "PBDs")]
    pub pbds: Vec<OpaqueRef>,
    pub physical_size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PbdRecord {
    pub uuid: String,
    pub host: OpaqueRef,
    #[serde(rename = "SR")]
    pub sr: OpaqueRef,
    pub device_config: StringMap,
    pub currently_attached: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "MTU")]
    pub mtu: i64,
    pub managed: bool,
    pub other_config: StringMap,
    pub bridge: String,
    pub tags: Vec<String>,
    #[serde(rename = "PIFs")]
    pub pifs: Vec<OpaqueRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PifRecord {
    pub uuid: String,
    pub device: String,
    pub network: OpaqueRef,
    pub host: OpaqueRef,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "MTU")]
    pub mtu: i64,
    pub physical: bool,
    pub management: bool,
    pub capabilities: Vec<String>,
    #[serde(rename = "VLAN")]
    pub vlan: i64,
    #[serde(rename = "VLAN_master_of")]
    pub vlan_master_of: OpaqueRef,
    pub bond_slave_of: OpaqueRef,
    pub bond_master_of: Vec<OpaqueRef>,
    #[serde(rename = "sriov_logical_PIF_of")]
    pub sriov_logical_pif_of: Vec<OpaqueRef>,
    #[serde(rename = "sriov_physical_PIF_of")]
    pub sriov_physical_pif_of: Vec<OpaqueRef>,
    #[serde(rename = "IP")]
    pub ip: String,
    pub ip_configuration_mode: IpConfigurationMode,
    pub metrics: OpaqueRef,
    pub disallow_unplug: bool,
    pub other_config: StringMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BondRecord {
    pub uuid: String,
    pub master: OpaqueRef,
    pub slaves: Vec<OpaqueRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VlanRecord {
    pub uuid: String,
    #[serde(rename = "tagged_PIF")]
    pub tagged_pif: OpaqueRef,
    #[serde(rename = "untagged_PIF")]
    pub untagged_pif: OpaqueRef,
    pub tag: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestMetricsRecord {
    pub uuid: String,
    pub networks: StringMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretRecord {
    pub uuid: String,
    pub value: String,
    pub other_config: StringMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_record_decodes_toolstack_field_names() {
        let record: VmRecord = serde_json::from_value(serde_json::json!({
            "uuid": "1f0c",
            "power_state": "Running",
            "VCPUs_max": 4,
            "HVM_boot_params": {"firmware": "uefi", "order": "cd"},
            "VBDs": ["OpaqueRef:a", "OpaqueRef:b"],
            "suspend_SR": "OpaqueRef:NULL",
            "some_field_we_ignore": true
        }))
        .unwrap();
        assert_eq!(record.power_state, PowerState::Running);
        assert_eq!(record.vcpus_max, 4);
        assert_eq!(record.hvm_boot_params["firmware"], "uefi");
        assert_eq!(record.vbds.len(), 2);
        assert!(record.suspend_sr.is_null());
    }

    #[test]
    fn unknown_power_state_does_not_fail() {
        let record: VmRecord =
            serde_json::from_value(serde_json::json!({"power_state": "Migrating"})).unwrap();
        assert_eq!(record.power_state, PowerState::Unknown);
    }

    #[test]
    fn vbd_enums_use_wire_names() {
        let vbd = VbdRecord {
            vbd_type: VbdType::Cd,
            mode: VbdMode::ReadOnly,
            ..Default::default()
        };
        let value = serde_json::to_value(&vbd).unwrap();
        assert_eq!(value["type"], "CD");
        assert_eq!(value["mode"], "RO");
    }
}
