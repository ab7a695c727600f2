//! VM reconciler.
//!
//! A VM is cloned from a template and then configured step by step. The order
//! of the steps is part of the contract:
//!
//! 1. template disks are recorded before any declared disk is attached, so
//!    they never show up as user-managed;
//! 2. bootable hard drives are created before the others, and the CD-ROM after
//!    all hard drives, because guests enumerate boot devices in creation order;
//! 3. the VM is provisioned and stops being a template;
//! 4. only then is it started, and the guest IP waited for.
//!
//! A failure after the clone destroys the half-built VM again.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::vbd::{self, HardDrive, HardDriveState};
use super::vif::{self, NetworkInterface, NetworkInterfaceState};
use super::{Reconciler, ensure_unchanged, ignore_gone};
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::other_config::OtherConfig;
use crate::resolve::ref_of;
use crate::retry::pause;
use crate::xapi::records::{GuestMetricsRecord, PowerState, StringMap, VbdMode, VmRecord};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

const PLATFORM: &str = "platform";
const HVM_BOOT_PARAMS: &str = "HVM_boot_params";
const CORES_PER_SOCKET: &str = "cores-per-socket";
const SECURE_BOOT: &str = "secureboot";
const FIRMWARE: &str = "firmware";
const BOOT_ORDER: &str = "order";

/// Firmware setup. `UefiSecurity` is UEFI firmware plus the secure boot
/// platform flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    Bios,
    Uefi,
    UefiSecurity,
}

impl BootMode {
    pub fn firmware(self) -> &'static str {
        match self {
            BootMode::Bios => "bios",
            BootMode::Uefi | BootMode::UefiSecurity => "uefi",
        }
    }

    pub fn secure_boot(self) -> bool {
        self == BootMode::UefiSecurity
    }

    /// Decode the remote firmware parameter and secure boot flag.
    pub fn from_remote(firmware: Option<&str>, secure_boot: Option<&str>) -> Option<Self> {
        match firmware? {
            "bios" => Some(BootMode::Bios),
            "uefi" => match secure_boot {
                Some(flag) if flag != "false" => Some(BootMode::UefiSecurity),
                _ => Some(BootMode::Uefi),
            },
            _ => None,
        }
    }

    fn of(vm: &VmRecord) -> Option<Self> {
        Self::from_remote(
            vm.hvm_boot_params.get(FIRMWARE).map(String::as_str),
            vm.platform.get(SECURE_BOOT).map(String::as_str),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub static_min: i64,
    pub static_max: i64,
    pub dynamic_min: i64,
    pub dynamic_max: i64,
}

impl MemoryLimits {
    fn of(vm: &VmRecord) -> Self {
        Self {
            static_min: vm.memory_static_min,
            static_max: vm.memory_static_max,
            dynamic_min: vm.memory_dynamic_min,
            dynamic_max: vm.memory_dynamic_max,
        }
    }

    fn is_ordered(&self) -> bool {
        self.static_min <= self.dynamic_min
            && self.dynamic_min <= self.dynamic_max
            && self.dynamic_max <= self.static_max
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    pub template_name: String,
    /// Bytes. The other limits default to this value.
    pub static_mem_max: i64,
    #[serde(default)]
    pub static_mem_min: Option<i64>,
    #[serde(default)]
    pub dynamic_mem_min: Option<i64>,
    #[serde(default)]
    pub dynamic_mem_max: Option<i64>,
    pub vcpus: u32,
    #[serde(default)]
    pub cores_per_socket: Option<u32>,
    #[serde(default)]
    pub boot_mode: Option<BootMode>,
    #[serde(default)]
    pub boot_order: Option<String>,
    #[serde(default)]
    pub other_config: StringMap,
    #[serde(rename = "hard_drive")]
    pub hard_drives: Vec<HardDrive>,
    #[serde(rename = "network_interface")]
    pub network_interfaces: Vec<NetworkInterface>,
    /// ISO name; `""` removes the drive.
    #[serde(default)]
    pub cdrom: Option<String>,
    /// Seconds to wait for a guest IP after start; 0 leaves the VM halted.
    #[serde(default)]
    pub check_ip_timeout: u64,
}

impl VmConfig {
    pub fn memory(&self) -> MemoryLimits {
        let max = self.static_mem_max;
        MemoryLimits {
            static_min: self.static_mem_min.unwrap_or(max),
            static_max: max,
            dynamic_min: self.dynamic_mem_min.unwrap_or(max),
            dynamic_max: self.dynamic_mem_max.unwrap_or(max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmState {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub template_name: String,
    pub static_mem_min: i64,
    pub static_mem_max: i64,
    pub dynamic_mem_min: i64,
    pub dynamic_mem_max: i64,
    pub vcpus: u32,
    pub cores_per_socket: u32,
    pub boot_mode: Option<BootMode>,
    pub boot_order: String,
    pub other_config: StringMap,
    #[serde(rename = "hard_drive")]
    pub hard_drives: Vec<HardDriveState>,
    #[serde(rename = "network_interface")]
    pub network_interfaces: Vec<NetworkInterfaceState>,
    pub cdrom: String,
    pub check_ip_timeout: u64,
    pub default_ip: String,
    pub power_state: PowerState,
}

/// Checks that need no remote state.
fn validate(config: &VmConfig) -> Result<()> {
    if config.name_label.is_empty() {
        return Err(ProviderError::invalid("name_label", "", "must not be empty"));
    }
    if config.vcpus == 0 {
        return Err(ProviderError::invalid("vcpus", 0, "at least one VCPU is required"));
    }
    match config.cores_per_socket {
        Some(0) => {
            return Err(ProviderError::invalid(
                "cores_per_socket",
                0,
                "must be at least 1",
            ));
        }
        Some(cps) if config.vcpus % cps != 0 => {
            return Err(ProviderError::CoresPerSocketMismatch {
                vcpus: config.vcpus,
                cores_per_socket: cps,
            });
        }
        _ => {}
    }
    let memory = config.memory();
    if memory.static_max <= 0 || !memory.is_ordered() {
        return Err(ProviderError::invalid(
            "static_mem_max",
            memory.static_max,
            "limits must satisfy 0 < static_min <= dynamic_min <= dynamic_max <= static_max",
        ));
    }
    if config.hard_drives.is_empty() {
        return Err(ProviderError::invalid(
            "hard_drive",
            0,
            "at least one hard drive is required",
        ));
    }
    vbd::check_unique(&config.hard_drives)?;
    if config.network_interfaces.is_empty() {
        return Err(ProviderError::invalid(
            "network_interface",
            0,
            "at least one network interface is required",
        ));
    }
    vif::check_unique(&config.network_interfaces)?;
    OtherConfig::default().apply_user_entries(&config.other_config)
}

/// The full validation pass of an update, run before any mutation.
fn validate_update(
    config: &VmConfig,
    state: &VmState,
    vm: &VmRecord,
    drives: &[HardDriveState],
    nics: &[NetworkInterfaceState],
) -> Result<()> {
    validate(config)?;
    ensure_unchanged("VM", "template_name", &config.template_name, &state.template_name)?;
    if let Some(mode) = config.boot_mode {
        ensure_unchanged("VM", "boot_mode", &Some(mode), &BootMode::of(vm))?;
    }
    vif::check_immutable(&config.network_interfaces, nics)?;

    if vm.power_state != PowerState::Running {
        return Ok(());
    }
    let running = |what: &'static str| ProviderError::VmRunning {
        vm: vm.uuid.clone(),
        what,
    };
    if config.memory() != MemoryLimits::of(vm) {
        return Err(running("memory"));
    }
    if i64::from(config.vcpus) != vm.vcpus_max {
        return Err(running("VCPUs"));
    }
    if let Some(cps) = config.cores_per_socket
        && vm.platform.get(CORES_PER_SOCKET) != Some(&cps.to_string())
    {
        return Err(running("cores-per-socket"));
    }
    let diff = vbd::diff_drives(&config.hard_drives, drives);
    if diff.update.iter().any(|u| u.mode.is_some()) {
        return Err(running("hard drive mode"));
    }
    if diff.create.iter().any(|d| d.mode == VbdMode::ReadOnly) {
        return Err(running("read-only hard drives"));
    }
    if diff.destroy.iter().any(|d| d.bootable) || diff.update.iter().any(|u| u.bootable.is_some()) {
        return Err(running("bootable hard drives"));
    }
    Ok(())
}

/// Exactly one template named `name`; snapshots do not count.
pub async fn find_template(session: &Session, name: &str) -> Result<OpaqueRef> {
    let vms = session
        .get_all_records::<VmRecord>(ObjectKind::Vm)
        .await
        .remote("VM.get_all_records", name)?;
    let matches: Vec<OpaqueRef> = vms
        .into_iter()
        .filter(|(_, vm)| vm.is_a_template && !vm.is_a_snapshot && vm.name_label == name)
        .map(|(reference, _)| reference)
        .collect();
    match matches.as_slice() {
        [] => Err(ProviderError::TemplateNotFound(name.to_string())),
        [template] => Ok(template.clone()),
        _ => Err(ProviderError::AmbiguousTemplate {
            name: name.to_string(),
            count: matches.len(),
        }),
    }
}

/// Whether `ip` is worth reporting as the guest's address.
pub fn is_routable(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_broadcast(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// First routable address among the guest-reported networks.
pub fn guest_ip(networks: &StringMap) -> Option<String> {
    networks
        .iter()
        .filter(|(key, _)| key.ends_with("ip") || key.contains("/ipv4/") || key.contains("/ipv6/"))
        .filter_map(|(_, value)| value.parse::<IpAddr>().ok())
        .find(is_routable)
        .map(|ip| ip.to_string())
}

async fn current_guest_ip(session: &Session, vm: &OpaqueRef) -> Result<Option<String>> {
    let metrics: OpaqueRef = session
        .get_field(ObjectKind::Vm, vm, "guest_metrics")
        .await
        .remote("VM.get_guest_metrics", vm)?;
    if metrics.is_null() {
        return Ok(None);
    }
    match session
        .get_record::<GuestMetricsRecord>(ObjectKind::VmGuestMetrics, &metrics)
        .await
    {
        Ok(record) => Ok(guest_ip(&record.networks)),
        Err(e) if e.is_gone() => Ok(None),
        Err(e) => Err(e).remote("VM_guest_metrics.get_record", &metrics),
    }
}

async fn set_map_entry(
    session: &Session,
    vm: &OpaqueRef,
    field: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    let mut map: StringMap = session
        .get_field(ObjectKind::Vm, vm, field)
        .await
        .remote(&format!("VM.get_{field}"), vm)?;
    if map.get(key).map(String::as_str) == Some(value) {
        return Ok(());
    }
    map.insert(key.to_string(), value.to_string());
    session
        .set_field(ObjectKind::Vm, vm, field, json!(map))
        .await
        .remote(&format!("VM.set_{field}"), vm)?;
    debug!(vm = %vm, field, key, value, "updated VM map entry");
    Ok(())
}

/// Note the disks the clone inherited, and drop the template's disk
/// provisioning recipe.
async fn record_template_disks(session: &Session, vm: &OpaqueRef) -> Result<()> {
    let record: VmRecord = session
        .get_record(ObjectKind::Vm, vm)
        .await
        .remote("VM.get_record", vm)?;
    let inherited: Vec<OpaqueRef> = vbd::disk_vbds(session, &record)
        .await?
        .into_iter()
        .map(|(vbd, _)| vbd)
        .collect();
    let mut other_config = OtherConfig::new(record.other_config);
    other_config.remove("disks");
    other_config.set_template_vbds(&inherited);
    session
        .set_field(ObjectKind::Vm, vm, "other_config", json!(other_config.as_map()))
        .await
        .remote("VM.set_other_config", vm)?;
    debug!(vm = %vm, disks = inherited.len(), "recorded template disks");
    Ok(())
}

async fn apply_other_config(session: &Session, vm: &OpaqueRef, config: &VmConfig) -> Result<()> {
    let current: StringMap = session
        .get_field(ObjectKind::Vm, vm, "other_config")
        .await
        .remote("VM.get_other_config", vm)?;
    let mut other_config = OtherConfig::new(current.clone());
    other_config.apply_user_entries(&config.other_config)?;
    other_config.set_check_ip_timeout(config.check_ip_timeout);
    other_config.set_template_name(&config.template_name);
    if other_config.as_map() != &current {
        session
            .set_field(ObjectKind::Vm, vm, "other_config", json!(other_config.as_map()))
            .await
            .remote("VM.set_other_config", vm)?;
    }
    Ok(())
}

async fn apply_names(
    session: &Session,
    vm: &OpaqueRef,
    record: &VmRecord,
    config: &VmConfig,
) -> Result<()> {
    if record.name_label != config.name_label {
        session
            .set_field(ObjectKind::Vm, vm, "name_label", json!(config.name_label))
            .await
            .remote("VM.set_name_label", vm)?;
    }
    if record.name_description != config.name_description {
        session
            .set_field(ObjectKind::Vm, vm, "name_description", json!(config.name_description))
            .await
            .remote("VM.set_name_description", vm)?;
    }
    Ok(())
}

async fn apply_memory(session: &Session, vm: &OpaqueRef, record: &VmRecord, wanted: MemoryLimits) -> Result<()> {
    if MemoryLimits::of(record) == wanted {
        return Ok(());
    }
    session
        .invoke_unit(
            "VM.set_memory_limits",
            vec![
                vm.into(),
                json!(wanted.static_min),
                json!(wanted.static_max),
                json!(wanted.dynamic_min),
                json!(wanted.dynamic_max),
            ],
        )
        .await
        .remote("VM.set_memory_limits", vm)?;
    debug!(vm = %vm, static_max = wanted.static_max, "set memory limits");
    Ok(())
}

/// Keep `0 < VCPUs_at_startup <= VCPUs_max` true after every call.
async fn apply_vcpus(session: &Session, vm: &OpaqueRef, record: &VmRecord, vcpus: u32) -> Result<()> {
    let wanted = i64::from(vcpus);
    let set_max = record.vcpus_max != wanted;
    let set_startup = record.vcpus_at_startup != wanted;
    if wanted >= record.vcpus_max {
        if set_max {
            set_vcpus_field(session, vm, "VCPUs_max", wanted).await?;
        }
        if set_startup {
            set_vcpus_field(session, vm, "VCPUs_at_startup", wanted).await?;
        }
    } else {
        if set_startup {
            set_vcpus_field(session, vm, "VCPUs_at_startup", wanted).await?;
        }
        set_vcpus_field(session, vm, "VCPUs_max", wanted).await?;
    }
    Ok(())
}

async fn set_vcpus_field(session: &Session, vm: &OpaqueRef, field: &str, value: i64) -> Result<()> {
    session
        .set_field(ObjectKind::Vm, vm, field, json!(value))
        .await
        .remote(&format!("VM.set_{field}"), vm)?;
    debug!(vm = %vm, field, value, "set VCPUs");
    Ok(())
}

/// An omitted topology keeps a current one that still fits, and otherwise
/// puts every core on one socket.
async fn apply_cores_per_socket(
    session: &Session,
    vm: &OpaqueRef,
    record: &VmRecord,
    config: &VmConfig,
) -> Result<()> {
    let current = record
        .platform
        .get(CORES_PER_SOCKET)
        .and_then(|v| v.parse::<u32>().ok());
    let wanted = match (config.cores_per_socket, current) {
        (Some(cps), _) => cps,
        (None, Some(cps)) if cps > 0 && config.vcpus % cps == 0 => return Ok(()),
        (None, _) => config.vcpus,
    };
    set_map_entry(session, vm, PLATFORM, CORES_PER_SOCKET, &wanted.to_string()).await
}

async fn apply_boot_mode(session: &Session, vm: &OpaqueRef, mode: BootMode) -> Result<()> {
    set_map_entry(session, vm, PLATFORM, SECURE_BOOT, &mode.secure_boot().to_string()).await?;
    set_map_entry(session, vm, HVM_BOOT_PARAMS, FIRMWARE, mode.firmware()).await
}

/// Bring the VM's hard drives in line with `desired`: detach first, then
/// attach (bootable first), then update in place.
async fn apply_drives(
    session: &Session,
    vm: &OpaqueRef,
    desired: &[HardDrive],
    running: bool,
) -> Result<()> {
    let record: VmRecord = session
        .get_record(ObjectKind::Vm, vm)
        .await
        .remote("VM.get_record", vm)?;
    let current = vbd::hard_drives(session, &record).await?;
    let diff = vbd::diff_drives(desired, &current);
    for drive in &diff.destroy {
        vbd::detach(session, &drive.vbd_ref, running && drive.attached).await?;
    }
    for drive in &diff.create {
        vbd::attach_drive(session, vm, drive, running).await?;
    }
    for update in &diff.update {
        vbd::apply_update(session, update).await?;
    }
    vbd::ensure_hard_drive(session, vm).await
}

async fn apply_interfaces(
    session: &Session,
    vm: &OpaqueRef,
    desired: &[NetworkInterface],
    running: bool,
) -> Result<()> {
    let record: VmRecord = session
        .get_record(ObjectKind::Vm, vm)
        .await
        .remote("VM.get_record", vm)?;
    let current = vif::interfaces(session, &record).await?;
    let diff = vif::diff_vifs(desired, &current);
    for nic in &diff.destroy {
        vif::destroy_vif(session, &nic.vif_ref, running && nic.attached).await?;
    }
    for (device, nic) in &diff.create {
        vif::create_vif(session, vm, device, nic, running).await?;
    }
    for (nic, existing) in &diff.update {
        vif::update_vif(session, nic, existing).await?;
    }
    Ok(())
}

/// Shut down and destroy `vm` with its attachments and the disks it got
/// from its template. A VM that is already gone is not an error.
pub(crate) async fn destroy_vm(session: &Session, vm: &OpaqueRef) -> Result<()> {
    let record: VmRecord = match session.get_record(ObjectKind::Vm, vm).await {
        Ok(record) => record,
        Err(e) if e.is_gone() => return Ok(()),
        Err(e) => return Err(e).remote("VM.get_record", vm),
    };
    if record.power_state != PowerState::Halted {
        session
            .invoke_unit("VM.hard_shutdown", vec![vm.into()])
            .await
            .remote("VM.hard_shutdown", &record.uuid)?;
    }
    for vif in &record.vifs {
        ignore_gone(session.destroy(ObjectKind::Vif, vif).await).remote("VIF.destroy", vif)?;
    }
    let inherited = OtherConfig::new(record.other_config.clone()).template_vbds();
    let mut template_vdis = Vec::new();
    for vbd in &record.vbds {
        if inherited.contains(vbd) {
            let vdi: OpaqueRef = ignore_gone(session.get_field(ObjectKind::Vbd, vbd, "VDI").await)
                .remote("VBD.get_VDI", vbd)?;
            if !vdi.is_null() {
                template_vdis.push(vdi);
            }
        }
        ignore_gone(session.destroy(ObjectKind::Vbd, vbd).await).remote("VBD.destroy", vbd)?;
    }
    for vdi in &template_vdis {
        ignore_gone(session.destroy(ObjectKind::Vdi, vdi).await).remote("VDI.destroy", vdi)?;
    }
    session
        .destroy(ObjectKind::Vm, vm)
        .await
        .remote("VM.destroy", &record.uuid)?;
    info!(vm = %record.uuid, disks = template_vdis.len(), "destroyed VM");
    Ok(())
}

/// Reconciles [`VmConfig`] against a VM cloned from a template.
#[derive(Debug, Clone)]
pub struct VmReconciler {
    pub ip_poll_interval: Duration,
}

impl Default for VmReconciler {
    fn default() -> Self {
        Self {
            ip_poll_interval: Duration::from_secs(5),
        }
    }
}

impl VmReconciler {
    /// Everything after the clone.
    async fn configure(&self, ctx: &ProviderContext, vm: &OpaqueRef, config: &VmConfig) -> Result<()> {
        let session = &ctx.session;
        record_template_disks(session, vm).await?;
        apply_other_config(session, vm, config).await?;

        let record: VmRecord = session
            .get_record(ObjectKind::Vm, vm)
            .await
            .remote("VM.get_record", vm)?;
        apply_names(session, vm, &record, config).await?;
        apply_memory(session, vm, &record, config.memory()).await?;
        apply_vcpus(session, vm, &record, config.vcpus).await?;
        apply_cores_per_socket(session, vm, &record, config).await?;
        if let Some(mode) = config.boot_mode {
            apply_boot_mode(session, vm, mode).await?;
        }
        if let Some(order) = &config.boot_order {
            set_map_entry(session, vm, HVM_BOOT_PARAMS, BOOT_ORDER, order).await?;
        }

        apply_drives(session, vm, &config.hard_drives, false).await?;
        vbd::set_cdrom(session, vm, config.cdrom.as_deref(), false).await?;
        apply_interfaces(session, vm, &config.network_interfaces, false).await?;

        session
            .invoke_unit("VM.provision", vec![vm.into()])
            .await
            .remote("VM.provision", vm)?;
        session
            .set_field(ObjectKind::Vm, vm, "is_a_template", json!(false))
            .await
            .remote("VM.set_is_a_template", vm)?;

        if config.check_ip_timeout > 0 {
            self.start_and_wait(ctx, vm, config.check_ip_timeout).await?;
        }
        Ok(())
    }

    async fn start_and_wait(&self, ctx: &ProviderContext, vm: &OpaqueRef, timeout: u64) -> Result<String> {
        ctx.session
            .invoke_unit("VM.start", vec![vm.into(), json!(false), json!(true)])
            .await
            .remote("VM.start", vm)?;
        info!(vm = %vm, "started VM");
        self.wait_for_ip(ctx, vm, Duration::from_secs(timeout)).await
    }

    /// Poll the guest metrics until a routable address shows up.
    pub async fn wait_for_ip(&self, ctx: &ProviderContext, vm: &OpaqueRef, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ip) = current_guest_ip(&ctx.session, vm).await? {
                info!(vm = %vm, ip = %ip, "guest reported an IP address");
                return Ok(ip);
            }
            let now = Instant::now();
            if now >= deadline {
                let uuid: String = ctx
                    .session
                    .get_uuid(ObjectKind::Vm, vm)
                    .await
                    .unwrap_or_else(|_| vm.to_string());
                return Err(ProviderError::Timeout {
                    wait: format!("guest IP of VM {uuid}"),
                    after: timeout,
                    last_error: None,
                });
            }
            pause(&ctx.cancel, self.ip_poll_interval.min(deadline - now), "guest IP").await?;
        }
    }

    async fn read_vm(&self, session: &Session, vm: &OpaqueRef) -> Result<VmState> {
        let record: VmRecord = session
            .get_record(ObjectKind::Vm, vm)
            .await
            .remote("VM.get_record", vm)?;
        let other_config = OtherConfig::new(record.other_config.clone());
        let hard_drives = vbd::hard_drives(session, &record).await?;
        let network_interfaces = vif::interfaces(session, &record).await?;
        let cdrom = vbd::current_cdrom(session, &record)
            .await?
            .map(|(_, _, iso)| iso)
            .unwrap_or_default();
        let check_ip_timeout = other_config.check_ip_timeout();
        let default_ip = if check_ip_timeout > 0 && record.power_state == PowerState::Running {
            current_guest_ip(session, vm).await?.unwrap_or_default()
        } else {
            String::new()
        };
        Ok(VmState {
            uuid: record.uuid.clone(),
            name_label: record.name_label.clone(),
            name_description: record.name_description.clone(),
            template_name: other_config.template_name().unwrap_or_default().to_string(),
            static_mem_min: record.memory_static_min,
            static_mem_max: record.memory_static_max,
            dynamic_mem_min: record.memory_dynamic_min,
            dynamic_mem_max: record.memory_dynamic_max,
            vcpus: u32::try_from(record.vcpus_at_startup).unwrap_or_default(),
            cores_per_socket: record
                .platform
                .get(CORES_PER_SOCKET)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            boot_mode: BootMode::of(&record),
            boot_order: record
                .hvm_boot_params
                .get(BOOT_ORDER)
                .cloned()
                .unwrap_or_default(),
            other_config: other_config.user_entries(),
            hard_drives,
            network_interfaces,
            cdrom,
            check_ip_timeout,
            default_ip,
            power_state: record.power_state,
        })
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    type Config = VmConfig;
    type State = VmState;

    async fn create(&self, ctx: &ProviderContext, config: &VmConfig) -> Result<VmState> {
        validate(config)?;
        let session = &ctx.session;
        let template = find_template(session, &config.template_name).await?;
        let vm: OpaqueRef = session
            .invoke("VM.clone", vec![(&template).into(), json!(config.name_label)])
            .await
            .remote("VM.clone", &config.template_name)?;
        info!(vm = %vm, template = %config.template_name, "cloned template");

        if let Err(e) = self.configure(ctx, &vm, config).await {
            warn!(vm = %vm, error = %e, "VM creation failed, destroying the clone");
            return Err(match destroy_vm(session, &vm).await {
                Ok(()) => e,
                Err(cleanup) => ProviderError::cleanup_failed(e, cleanup),
            });
        }
        let state = self.read_vm(session, &vm).await?;
        info!(vm = %state.uuid, name = %state.name_label, "created VM");
        Ok(state)
    }

    async fn read(&self, ctx: &ProviderContext, state: &VmState) -> Result<VmState> {
        let vm = ref_of(&ctx.session, ObjectKind::Vm, &state.uuid).await?;
        self.read_vm(&ctx.session, &vm).await
    }

    async fn update(&self, ctx: &ProviderContext, config: &VmConfig, state: &VmState) -> Result<VmState> {
        let session = &ctx.session;
        let vm = ref_of(session, ObjectKind::Vm, &state.uuid).await?;
        let record: VmRecord = session
            .get_record(ObjectKind::Vm, &vm)
            .await
            .remote("VM.get_record", &state.uuid)?;
        let drives = vbd::hard_drives(session, &record).await?;
        let nics = vif::interfaces(session, &record).await?;
        validate_update(config, state, &record, &drives, &nics)?;

        let running = record.power_state == PowerState::Running;
        apply_other_config(session, &vm, config).await?;
        apply_names(session, &vm, &record, config).await?;
        if !running {
            apply_memory(session, &vm, &record, config.memory()).await?;
            apply_vcpus(session, &vm, &record, config.vcpus).await?;
            apply_cores_per_socket(session, &vm, &record, config).await?;
        }
        if let Some(order) = &config.boot_order {
            set_map_entry(session, &vm, HVM_BOOT_PARAMS, BOOT_ORDER, order).await?;
        }
        apply_drives(session, &vm, &config.hard_drives, running).await?;
        vbd::set_cdrom(session, &vm, config.cdrom.as_deref(), running).await?;
        apply_interfaces(session, &vm, &config.network_interfaces, running).await?;

        let mut default_ip = None;
        if config.check_ip_timeout > 0 && record.power_state == PowerState::Halted {
            default_ip = Some(self.start_and_wait(ctx, &vm, config.check_ip_timeout).await?);
        }
        let mut updated = self.read_vm(session, &vm).await?;
        if let Some(ip) = default_ip
            && updated.default_ip.is_empty()
        {
            updated.default_ip = ip;
        }
        info!(vm = %updated.uuid, "updated VM");
        Ok(updated)
    }

    async fn delete(&self, ctx: &ProviderContext, state: &VmState) -> Result<()> {
        let session = &ctx.session;
        match crate::resolve::find_ref(session, ObjectKind::Vm, &state.uuid).await? {
            Some(vm) => destroy_vm(session, &vm).await,
            None => {
                debug!(vm = %state.uuid, "VM already gone");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeXapi;

    const GIB: i64 = 1 << 30;

    fn fixture() -> FakeXapi {
        let fake = FakeXapi::new();
        let sr = fake.insert(ObjectKind::Sr, json!({"uuid": "sr-local", "type": "lvm"}));
        let template_disk = fake.insert(ObjectKind::Vdi, json!({"uuid": "tpl-disk", "SR": sr}));
        let template = fake.insert(
            ObjectKind::Vm,
            json!({
                "uuid": "tpl", "name_label": "Debian 12", "is_a_template": true,
                "memory_static_min": GIB, "memory_static_max": GIB,
                "memory_dynamic_min": GIB, "memory_dynamic_max": GIB,
                "HVM_boot_params": {"order": "cd", "firmware": "bios"},
                "other_config": {"disks": "<provision/>"},
            }),
        );
        fake.insert(
            ObjectKind::Vbd,
            json!({"VM": template, "VDI": template_disk, "userdevice": "0", "bootable": true}),
        );
        for uuid in ["root", "data", "extra"] {
            fake.insert(ObjectKind::Vdi, json!({"uuid": uuid, "name_label": uuid, "SR": sr}));
        }
        fake.insert(ObjectKind::Vdi, json!({"name_label": "debian.iso", "type": "iso"}));
        fake.insert(ObjectKind::Network, json!({"uuid": "lan"}));
        fake.insert(ObjectKind::Network, json!({"uuid": "dmz"}));
        fake
    }

    fn drive(uuid: &str, bootable: bool) -> HardDrive {
        HardDrive {
            vdi_uuid: uuid.to_string(),
            mode: VbdMode::ReadWrite,
            bootable,
        }
    }

    fn nic(network: &str) -> NetworkInterface {
        NetworkInterface {
            network_uuid: network.to_string(),
            device: None,
            mac: None,
            mtu: None,
            other_config: StringMap::new(),
        }
    }

    fn config() -> VmConfig {
        VmConfig {
            name_label: "web".into(),
            name_description: "frontend".into(),
            template_name: "Debian 12".into(),
            static_mem_max: 2 * GIB,
            static_mem_min: None,
            dynamic_mem_min: None,
            dynamic_mem_max: None,
            vcpus: 4,
            cores_per_socket: Some(2),
            boot_mode: None,
            boot_order: None,
            other_config: StringMap::new(),
            hard_drives: vec![drive("data", false), drive("root", true)],
            network_interfaces: vec![nic("lan")],
            cdrom: None,
            check_ip_timeout: 0,
        }
    }

    fn reconciler() -> VmReconciler {
        VmReconciler {
            ip_poll_interval: Duration::from_millis(10),
        }
    }

    fn vdi_ref(fake: &FakeXapi, uuid: &str) -> String {
        fake.find_by_uuid(ObjectKind::Vdi, uuid).unwrap().to_string()
    }

    #[tokio::test]
    async fn create_applies_hardware_in_boot_order() {
        let fake = fixture();
        let ctx = fake.context();
        let mut config = config();
        config.boot_mode = Some(BootMode::UefiSecurity);
        config.cdrom = Some("debian.iso".into());
        config.other_config = [("owner".to_string(), "ops".to_string())].into();

        let state = reconciler().create(&ctx, &config).await.unwrap();

        let vm = fake.find_by_uuid(ObjectKind::Vm, &state.uuid).unwrap();
        let record = fake.record(ObjectKind::Vm, &vm).unwrap();
        assert_eq!(record["platform"][CORES_PER_SOCKET], "2");
        assert_eq!(record["platform"][SECURE_BOOT], "true");
        assert_eq!(record["HVM_boot_params"][FIRMWARE], "uefi");
        assert_eq!(record["VCPUs_max"], 4);
        assert_eq!(record["is_a_template"], false);
        assert!(record["other_config"].get("disks").is_none());

        let created: Vec<String> = fake
            .calls_to("VBD.create")
            .iter()
            .map(|c| c.arg(0).unwrap()["VDI"].as_str().unwrap().to_string())
            .collect();
        let iso = fake
            .all(ObjectKind::Vdi)
            .into_iter()
            .find(|(_, r)| r["name_label"] == "debian.iso")
            .unwrap()
            .0;
        assert_eq!(
            created,
            vec![vdi_ref(&fake, "root"), vdi_ref(&fake, "data"), iso.to_string()]
        );
        let mutations = fake.mutations();
        let provision = mutations.iter().position(|m| m == "VM.provision").unwrap();
        let last_vif = mutations.iter().rposition(|m| m == "VIF.create").unwrap();
        assert!(last_vif < provision);

        assert_eq!(state.boot_mode, Some(BootMode::UefiSecurity));
        assert_eq!(state.cores_per_socket, 2);
        assert_eq!(state.hard_drives.len(), 2);
        assert_eq!(state.cdrom, "debian.iso");
        assert_eq!(state.template_name, "Debian 12");
        assert_eq!(state.other_config, config.other_config);
        assert_eq!(state.network_interfaces[0].device, "0");
        assert_eq!(state.power_state, PowerState::Halted);
    }

    #[tokio::test]
    async fn template_disks_are_tracked_but_hidden() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();

        let vm = fake.find_by_uuid(ObjectKind::Vm, &state.uuid).unwrap();
        let record: VmRecord =
            serde_json::from_value(fake.record(ObjectKind::Vm, &vm).unwrap()).unwrap();
        let inherited = OtherConfig::new(record.other_config.clone()).template_vbds();
        assert_eq!(inherited.len(), 1);
        assert!(state.hard_drives.iter().all(|d| d.vbd_ref != inherited[0]));
        assert!(state.other_config.is_empty());

        let again = reconciler().read(&ctx, &state).await.unwrap();
        assert_eq!(again, state);
    }

    #[tokio::test]
    async fn cores_per_socket_mismatch_issues_no_vcpu_calls() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        fake.clear_calls();

        let mut changed = config();
        changed.vcpus = 3;
        let err = reconciler().update(&ctx, &changed, &state).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "3 cores could not fit to 2 cores-per-socket topology"
        );
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn invalid_topology_fails_before_cloning() {
        let fake = fixture();
        let ctx = fake.context();
        let mut config = config();
        config.vcpus = 3;
        let err = reconciler().create(&ctx, &config).await.unwrap_err();
        assert!(matches!(err, ProviderError::CoresPerSocketMismatch { vcpus: 3, cores_per_socket: 2 }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn immutable_fields_are_rejected_without_mutations() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        let mac = state.network_interfaces[0].mac.clone();

        let mut template = config();
        template.template_name = "Ubuntu 24.04".into();
        let mut boot = config();
        boot.boot_mode = Some(BootMode::Uefi);
        let mut nic_mac = config();
        nic_mac.network_interfaces[0].mac = Some(format!("{mac}ff"));
        let mut nic_mtu = config();
        nic_mtu.network_interfaces[0].mtu = Some(9000);

        for (changed, field) in [
            (template, "template_name"),
            (boot, "boot_mode"),
            (nic_mac, "network_interface[0].mac"),
            (nic_mtu, "network_interface[0].mtu"),
        ] {
            fake.clear_calls();
            let err = reconciler().update(&ctx, &changed, &state).await.unwrap_err();
            assert_eq!(err.attribute(), Some(field));
            assert!(fake.mutations().is_empty(), "{field}: {:?}", fake.mutations());
        }
    }

    #[tokio::test]
    async fn running_vm_refuses_memory_changes() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        let vm = fake.find_by_uuid(ObjectKind::Vm, &state.uuid).unwrap();
        fake.set(ObjectKind::Vm, &vm, "power_state", json!("Running"));
        fake.clear_calls();

        let mut changed = config();
        changed.static_mem_max = 4 * GIB;
        let err = reconciler().update(&ctx, &changed, &state).await.unwrap_err();
        assert!(matches!(err, ProviderError::VmRunning { what: "memory", .. }));

        let mut changed = config();
        changed.vcpus = 2;
        let err = reconciler().update(&ctx, &changed, &state).await.unwrap_err();
        assert!(matches!(err, ProviderError::VmRunning { what: "VCPUs", .. }));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn running_vm_refuses_risky_drive_changes() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        let vm = fake.find_by_uuid(ObjectKind::Vm, &state.uuid).unwrap();
        fake.set(ObjectKind::Vm, &vm, "power_state", json!("Running"));
        fake.clear_calls();

        let mut read_only = config();
        read_only.hard_drives.push(HardDrive {
            mode: VbdMode::ReadOnly,
            ..drive("extra", false)
        });
        let mut mode = config();
        mode.hard_drives[0].mode = VbdMode::ReadOnly;
        let mut dropped_boot = config();
        dropped_boot.hard_drives = vec![drive("data", false)];
        let mut flipped_boot = config();
        flipped_boot.hard_drives = vec![drive("data", true), drive("root", false)];

        for (changed, expected) in [
            (read_only, "read-only hard drives"),
            (mode, "hard drive mode"),
            (dropped_boot, "bootable hard drives"),
            (flipped_boot, "bootable hard drives"),
        ] {
            let err = reconciler().update(&ctx, &changed, &state).await.unwrap_err();
            assert!(
                matches!(err, ProviderError::VmRunning { what, .. } if what == expected),
                "{expected}: {err}"
            );
        }
        assert!(fake.mutations().is_empty());

        let mut writable = config();
        writable.hard_drives.push(drive("extra", false));
        let updated = reconciler().update(&ctx, &writable, &state).await.unwrap();
        assert_eq!(updated.hard_drives.len(), 3);
        assert_eq!(fake.mutations(), vec!["VBD.create", "VBD.plug"]);
    }

    #[tokio::test]
    async fn drive_changes_keep_unchanged_attachments() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        let root_vbd = state
            .hard_drives
            .iter()
            .find(|d| d.vdi_uuid == "root")
            .unwrap()
            .vbd_ref
            .clone();
        fake.clear_calls();

        let mut changed = config();
        changed.hard_drives = vec![drive("root", true), drive("extra", false)];
        let updated = reconciler().update(&ctx, &changed, &state).await.unwrap();

        assert_eq!(fake.mutations(), vec!["VBD.destroy", "VBD.create"]);
        let mut disks: Vec<&str> = updated.hard_drives.iter().map(|d| d.vdi_uuid.as_str()).collect();
        disks.sort_unstable();
        assert_eq!(disks, vec!["extra", "root"]);
        let root = updated.hard_drives.iter().find(|d| d.vdi_uuid == "root").unwrap();
        assert_eq!(root.vbd_ref, root_vbd);
    }

    #[tokio::test]
    async fn shrinking_vcpus_lowers_startup_first() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        fake.clear_calls();

        let mut changed = config();
        changed.vcpus = 2;
        reconciler().update(&ctx, &changed, &state).await.unwrap();
        let vcpu_calls: Vec<String> = fake
            .mutations()
            .into_iter()
            .filter(|m| m.starts_with("VM.set_VCPUs"))
            .collect();
        assert_eq!(vcpu_calls, vec!["VM.set_VCPUs_at_startup", "VM.set_VCPUs_max"]);
    }

    #[tokio::test]
    async fn start_waits_for_a_routable_ip() {
        let fake = fixture();
        fake.set_guest_networks(&[("0/ip", "169.254.0.7"), ("0/ipv4/0", "10.0.0.50")]);
        let ctx = fake.context();
        let mut config = config();
        config.check_ip_timeout = 30;

        let state = reconciler().create(&ctx, &config).await.unwrap();
        assert_eq!(state.power_state, PowerState::Running);
        assert_eq!(state.default_ip, "10.0.0.50");
        assert_eq!(state.check_ip_timeout, 30);
    }

    #[tokio::test]
    async fn ip_timeout_destroys_the_new_vm() {
        let fake = fixture();
        fake.set_guest_networks(&[("0/ip", "169.254.0.7")]);
        let ctx = fake.context();
        let vms = fake.count(ObjectKind::Vm);
        let vdis = fake.count(ObjectKind::Vdi);
        let mut config = config();
        config.check_ip_timeout = 1;

        let err = reconciler().create(&ctx, &config).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { after, .. } if after == Duration::from_secs(1)));
        assert!(err.to_string().contains("guest IP"));
        assert_eq!(fake.count(ObjectKind::Vm), vms);
        assert_eq!(fake.count(ObjectKind::Vdi), vdis);
    }

    #[tokio::test]
    async fn failed_cleanup_reports_both_errors() {
        let fake = fixture();
        fake.fail("VM.provision", "INTERNAL_ERROR", &["provision"]);
        fake.fail("VM.destroy", "INTERNAL_ERROR", &["destroy"]);
        let ctx = fake.context();

        let err = reconciler().create(&ctx, &config()).await.unwrap_err();
        let ProviderError::CleanupFailed { original, cleanup } = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(original.to_string().contains("VM.provision"));
        assert!(cleanup.to_string().contains("VM.destroy"));
    }

    #[tokio::test]
    async fn delete_removes_template_disks_but_keeps_declared_ones() {
        let fake = fixture();
        let ctx = fake.context();
        let vdis = fake.count(ObjectKind::Vdi);
        let vbds = fake.count(ObjectKind::Vbd);
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        assert_eq!(fake.count(ObjectKind::Vdi), vdis + 1);

        reconciler().delete(&ctx, &state).await.unwrap();
        assert!(fake.find_by_uuid(ObjectKind::Vm, &state.uuid).is_none());
        assert_eq!(fake.count(ObjectKind::Vdi), vdis);
        assert_eq!(fake.count(ObjectKind::Vbd), vbds);
        assert_eq!(fake.count(ObjectKind::Vif), 0);

        reconciler().delete(&ctx, &state).await.unwrap();
    }

    #[tokio::test]
    async fn delete_shuts_down_a_suspended_vm_first() {
        let fake = fixture();
        let ctx = fake.context();
        let state = reconciler().create(&ctx, &config()).await.unwrap();
        let vm = fake.find_by_uuid(ObjectKind::Vm, &state.uuid).unwrap();
        fake.set(ObjectKind::Vm, &vm, "power_state", json!("Suspended"));
        fake.clear_calls();

        reconciler().delete(&ctx, &state).await.unwrap();
        let mutations = fake.mutations();
        let shutdown = mutations.iter().position(|m| m == "VM.hard_shutdown").unwrap();
        let first_vif = mutations.iter().position(|m| m == "VIF.destroy").unwrap();
        let first_vbd = mutations.iter().position(|m| m == "VBD.destroy").unwrap();
        assert!(shutdown < first_vif);
        assert!(shutdown < first_vbd);
        assert_eq!(mutations.last().map(String::as_str), Some("VM.destroy"));
        assert!(fake.find_by_uuid(ObjectKind::Vm, &state.uuid).is_none());
    }

    #[tokio::test]
    async fn template_lookup_is_exact_and_unambiguous() {
        let fake = fixture();
        fake.insert(
            ObjectKind::Vm,
            json!({"name_label": "Debian 12", "is_a_template": true, "is_a_snapshot": true}),
        );
        let session = fake.session();
        assert!(find_template(&session, "Debian 12").await.is_ok());
        let err = find_template(&session, "Debian").await.unwrap_err();
        assert!(matches!(err, ProviderError::TemplateNotFound(_)));

        fake.insert(ObjectKind::Vm, json!({"name_label": "Debian 12", "is_a_template": true}));
        let err = find_template(&session, "Debian 12").await.unwrap_err();
        assert!(matches!(err, ProviderError::AmbiguousTemplate { count: 2, .. }));
        assert_eq!(err.attribute(), Some("template_name"));
    }

    #[test]
    fn boot_mode_round_trips_through_firmware_and_flag() {
        for mode in [BootMode::Bios, BootMode::Uefi, BootMode::UefiSecurity] {
            let flag = mode.secure_boot().to_string();
            assert_eq!(BootMode::from_remote(Some(mode.firmware()), Some(flag.as_str())), Some(mode));
        }
        assert_eq!(BootMode::from_remote(Some("uefi"), None), Some(BootMode::Uefi));
        assert_eq!(BootMode::from_remote(Some("uefi"), Some("auto")), Some(BootMode::UefiSecurity));
        assert_eq!(BootMode::from_remote(None, Some("true")), None);
    }

    #[test]
    fn guest_ip_skips_unusable_addresses() {
        let networks: StringMap = [
            ("0/ip", "127.0.0.1"),
            ("0/ipv4/0", "169.254.10.1"),
            ("0/ipv6/0", "fe80::1"),
            ("1/ip", "224.0.0.5"),
            ("1/ipv6/0", "2001:db8::20"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(guest_ip(&networks).as_deref(), Some("2001:db8::20"));
        assert_eq!(guest_ip(&StringMap::new()), None);
    }
}
