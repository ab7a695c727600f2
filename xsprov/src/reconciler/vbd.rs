//! Disk and CD-ROM attachments of a VM.
//!
//! Hard drives are keyed by the UUID of their backing VDI. Attachments the VM
//! inherited from its template are listed in the `tf_template_vbds` entry and
//! never show up here.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{ProviderError, RemoteContext, Result};
use crate::other_config::OtherConfig;
use crate::resolve::{ref_of, uuid_of};
use crate::xapi::records::{VbdMode, VbdRecord, VbdType, VdiRecord, VmRecord};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

/// A declared hard drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardDrive {
    pub vdi_uuid: String,
    #[serde(default)]
    pub mode: VbdMode,
    #[serde(default)]
    pub bootable: bool,
}

/// A hard drive as attached on the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardDriveState {
    pub vdi_uuid: String,
    pub mode: VbdMode,
    pub bootable: bool,
    pub vbd_ref: OpaqueRef,
    #[serde(default)]
    pub attached: bool,
}

/// In-place change to an existing attachment.
#[derive(Debug, PartialEq, Eq)]
pub struct DriveUpdate<'a> {
    pub current: &'a HardDriveState,
    pub mode: Option<VbdMode>,
    pub bootable: Option<bool>,
}

/// Set difference between declared and attached hard drives.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DriveDiff<'a> {
    /// Bootable drives first.
    pub create: Vec<&'a HardDrive>,
    pub destroy: Vec<&'a HardDriveState>,
    pub update: Vec<DriveUpdate<'a>>,
}

pub fn diff_drives<'a>(desired: &'a [HardDrive], current: &'a [HardDriveState]) -> DriveDiff<'a> {
    let mut diff = DriveDiff::default();
    for drive in desired {
        match current.iter().find(|c| c.vdi_uuid == drive.vdi_uuid) {
            None => diff.create.push(drive),
            Some(existing) => {
                let mode = (existing.mode != drive.mode).then_some(drive.mode);
                let bootable = (existing.bootable != drive.bootable).then_some(drive.bootable);
                if mode.is_some() || bootable.is_some() {
                    diff.update.push(DriveUpdate {
                        current: existing,
                        mode,
                        bootable,
                    });
                }
            }
        }
    }
    diff.destroy = current
        .iter()
        .filter(|c| !desired.iter().any(|d| d.vdi_uuid == c.vdi_uuid))
        .collect();
    // Guests enumerate boot devices in creation order.
    diff.create.sort_by_key(|d| !d.bootable);
    diff
}

/// Reject duplicate backing disks in a declaration.
pub fn check_unique(desired: &[HardDrive]) -> Result<()> {
    for (i, drive) in desired.iter().enumerate() {
        if desired[..i].iter().any(|d| d.vdi_uuid == drive.vdi_uuid) {
            return Err(ProviderError::invalid(
                "hard_drive",
                &drive.vdi_uuid,
                "the same VDI is attached twice",
            ));
        }
    }
    Ok(())
}

/// Disk VBDs of `vm`, including the template-inherited ones.
pub async fn disk_vbds(session: &Session, vm: &VmRecord) -> Result<Vec<(OpaqueRef, VbdRecord)>> {
    let mut disks = Vec::new();
    for vbd in &vm.vbds {
        let record: VbdRecord = session
            .get_record(ObjectKind::Vbd, vbd)
            .await
            .remote("VBD.get_record", vbd)?;
        if record.vbd_type == VbdType::Disk {
            disks.push((vbd.clone(), record));
        }
    }
    Ok(disks)
}

/// User-managed hard drives of `vm`.
pub async fn hard_drives(session: &Session, vm: &VmRecord) -> Result<Vec<HardDriveState>> {
    let inherited = OtherConfig::new(vm.other_config.clone()).template_vbds();
    let mut drives = Vec::new();
    for (vbd, record) in disk_vbds(session, vm).await? {
        if inherited.contains(&vbd) || record.vdi.is_null() {
            continue;
        }
        drives.push(HardDriveState {
            vdi_uuid: uuid_of(session, ObjectKind::Vdi, &record.vdi).await?,
            mode: record.mode,
            bootable: record.bootable,
            vbd_ref: vbd,
            attached: record.currently_attached,
        });
    }
    Ok(drives)
}

/// Fail unless `vm` has at least one disk attached.
pub async fn ensure_hard_drive(session: &Session, vm_ref: &OpaqueRef) -> Result<()> {
    let vm: VmRecord = session
        .get_record(ObjectKind::Vm, vm_ref)
        .await
        .remote("VM.get_record", vm_ref)?;
    if disk_vbds(session, &vm).await?.is_empty() {
        return Err(ProviderError::NotFound {
            what: "hard drive",
            detail: format!("VM {} has none, please attach at least one", vm.uuid),
        });
    }
    Ok(())
}

/// Create a VBD for `vdi` in the first free device slot, plugging it into a
/// running VM.
pub async fn attach(
    session: &Session,
    vm: &OpaqueRef,
    vdi: &OpaqueRef,
    vbd_type: VbdType,
    mode: VbdMode,
    bootable: bool,
    running: bool,
) -> Result<OpaqueRef> {
    let devices: Vec<String> = session
        .invoke("VM.get_allowed_VBD_devices", vec![vm.into()])
        .await
        .remote("VM.get_allowed_VBD_devices", vm)?;
    let userdevice = devices.into_iter().next().ok_or_else(|| ProviderError::NotFound {
        what: "free VBD device",
        detail: format!("no device slot left on VM {vm}"),
    })?;
    let record = VbdRecord {
        vm: vm.clone(),
        vdi: vdi.clone(),
        vbd_type,
        mode: if vbd_type == VbdType::Cd { VbdMode::ReadOnly } else { mode },
        bootable,
        userdevice,
        ..Default::default()
    };
    let vbd = session
        .create(ObjectKind::Vbd, &record)
        .await
        .remote("VBD.create", vdi)?;
    debug!(vbd = %vbd, vdi = %vdi, device = %record.userdevice, "created VBD");
    if running {
        session
            .invoke_unit("VBD.plug", vec![(&vbd).into()])
            .await
            .remote("VBD.plug", &vbd)?;
    }
    Ok(vbd)
}

/// Attach a declared hard drive.
pub async fn attach_drive(
    session: &Session,
    vm: &OpaqueRef,
    drive: &HardDrive,
    running: bool,
) -> Result<OpaqueRef> {
    let vdi = ref_of(session, ObjectKind::Vdi, &drive.vdi_uuid).await?;
    attach(session, vm, &vdi, VbdType::Disk, drive.mode, drive.bootable, running).await
}

/// Unplug (when attached) and destroy a VBD.
pub async fn detach(session: &Session, vbd: &OpaqueRef, attached: bool) -> Result<()> {
    if attached {
        session
            .invoke_unit("VBD.unplug", vec![vbd.into()])
            .await
            .remote("VBD.unplug", vbd)?;
    }
    session
        .destroy(ObjectKind::Vbd, vbd)
        .await
        .remote("VBD.destroy", vbd)?;
    debug!(vbd = %vbd, "destroyed VBD");
    Ok(())
}

pub async fn apply_update(session: &Session, update: &DriveUpdate<'_>) -> Result<()> {
    let vbd = &update.current.vbd_ref;
    if let Some(mode) = update.mode {
        session
            .set_field(ObjectKind::Vbd, vbd, "mode", json!(mode))
            .await
            .remote("VBD.set_mode", vbd)?;
    }
    if let Some(bootable) = update.bootable {
        session
            .set_field(ObjectKind::Vbd, vbd, "bootable", json!(bootable))
            .await
            .remote("VBD.set_bootable", vbd)?;
    }
    Ok(())
}

/// The only ISO VDI named `name`.
pub async fn iso_vdi(session: &Session, name: &str) -> Result<OpaqueRef> {
    let vdis = session
        .get_all_records::<VdiRecord>(ObjectKind::Vdi)
        .await
        .remote("VDI.get_all_records", name)?;
    let mut matches = vdis.into_iter().filter(|(_, r)| r.name_label == name);
    match (matches.next(), matches.next()) {
        (Some((vdi, _)), None) => Ok(vdi),
        (None, _) => Err(ProviderError::NotFound {
            what: "ISO",
            detail: format!("no VDI named {name:?}"),
        }),
        (Some(_), Some(_)) => Err(ProviderError::invalid(
            "cdrom",
            name,
            "more than one VDI has this name",
        )),
    }
}

/// The CD-ROM VBD of `vm` and the name of the ISO in it ("" when empty).
pub async fn current_cdrom(
    session: &Session,
    vm: &VmRecord,
) -> Result<Option<(OpaqueRef, VbdRecord, String)>> {
    let mut found = None;
    for vbd in &vm.vbds {
        let record: VbdRecord = session
            .get_record(ObjectKind::Vbd, vbd)
            .await
            .remote("VBD.get_record", vbd)?;
        if record.vbd_type != VbdType::Cd {
            continue;
        }
        if found.is_some() {
            return Err(ProviderError::invalid(
                "cdrom",
                &vm.uuid,
                "VM has more than one CD-ROM drive",
            ));
        }
        let iso = if record.vdi.is_null() || record.empty {
            String::new()
        } else {
            session
                .get_field(ObjectKind::Vdi, &record.vdi, "name_label")
                .await
                .remote("VDI.get_name_label", &record.vdi)?
        };
        found = Some((vbd.clone(), record, iso));
    }
    Ok(found)
}

/// Make the CD-ROM hold `iso`; `""` removes the drive. `None` keeps whatever
/// the template came with.
pub async fn set_cdrom(
    session: &Session,
    vm_ref: &OpaqueRef,
    iso: Option<&str>,
    running: bool,
) -> Result<()> {
    let Some(iso) = iso else {
        return Ok(());
    };
    let vm: VmRecord = session
        .get_record(ObjectKind::Vm, vm_ref)
        .await
        .remote("VM.get_record", vm_ref)?;
    let current = current_cdrom(session, &vm).await?;
    if let Some((vbd, record, name)) = &current {
        if name == iso {
            return Ok(());
        }
        detach(session, vbd, record.currently_attached).await?;
    }
    if !iso.is_empty() {
        let vdi = iso_vdi(session, iso).await?;
        attach(session, vm_ref, &vdi, VbdType::Cd, VbdMode::ReadOnly, false, running).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeXapi;

    fn drive(uuid: &str, bootable: bool) -> HardDrive {
        HardDrive {
            vdi_uuid: uuid.to_string(),
            mode: VbdMode::ReadWrite,
            bootable,
        }
    }

    fn attached(uuid: &str, vbd: &str) -> HardDriveState {
        HardDriveState {
            vdi_uuid: uuid.to_string(),
            mode: VbdMode::ReadWrite,
            bootable: false,
            vbd_ref: OpaqueRef::new(vbd),
            attached: false,
        }
    }

    #[test]
    fn diff_is_keyed_by_backing_disk() {
        let current = [attached("a", "OpaqueRef:1"), attached("b", "OpaqueRef:2")];
        let desired = [drive("b", false), drive("c", false)];
        let diff = diff_drives(&desired, &current);
        assert_eq!(diff.create, vec![&desired[1]]);
        assert_eq!(diff.destroy, vec![&current[0]]);
        assert!(diff.update.is_empty());
    }

    #[test]
    fn changed_flags_update_in_place() {
        let current = [attached("a", "OpaqueRef:1")];
        let desired = [HardDrive {
            vdi_uuid: "a".into(),
            mode: VbdMode::ReadOnly,
            bootable: true,
        }];
        let diff = diff_drives(&desired, &current);
        assert!(diff.create.is_empty() && diff.destroy.is_empty());
        assert_eq!(
            diff.update,
            vec![DriveUpdate {
                current: &current[0],
                mode: Some(VbdMode::ReadOnly),
                bootable: Some(true),
            }]
        );
    }

    #[test]
    fn bootable_drives_are_created_first() {
        let desired = [drive("data", false), drive("root", true), drive("logs", false)];
        let diff = diff_drives(&desired, &[]);
        let order: Vec<&str> = diff.create.iter().map(|d| d.vdi_uuid.as_str()).collect();
        assert_eq!(order, vec!["root", "data", "logs"]);
    }

    #[test]
    fn duplicate_disks_are_rejected() {
        let err = check_unique(&[drive("a", true), drive("a", false)]).unwrap_err();
        assert_eq!(err.attribute(), Some("hard_drive"));
    }

    #[tokio::test]
    async fn iso_lookup_requires_a_unique_name() {
        let fake = FakeXapi::new();
        fake.insert(ObjectKind::Vdi, json!({"name_label": "debian.iso", "type": "iso"}));
        fake.insert(ObjectKind::Vdi, json!({"name_label": "tools.iso", "type": "iso"}));
        fake.insert(ObjectKind::Vdi, json!({"name_label": "tools.iso", "type": "iso"}));
        let session = fake.session();

        assert!(iso_vdi(&session, "debian.iso").await.is_ok());
        let err = iso_vdi(&session, "tools.iso").await.unwrap_err();
        assert_eq!(err.attribute(), Some("cdrom"));
        let err = iso_vdi(&session, "missing.iso").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { what: "ISO", .. }));
    }

    #[tokio::test]
    async fn cdrom_is_swapped_only_when_the_iso_changes() {
        let fake = FakeXapi::new();
        let vm = fake.insert(ObjectKind::Vm, json!({"name_label": "web"}));
        fake.insert(ObjectKind::Vdi, json!({"name_label": "a.iso"}));
        fake.insert(ObjectKind::Vdi, json!({"name_label": "b.iso"}));
        let session = fake.session();

        set_cdrom(&session, &vm, Some("a.iso"), false).await.unwrap();
        fake.clear_calls();
        set_cdrom(&session, &vm, Some("a.iso"), false).await.unwrap();
        assert!(fake.mutations().is_empty());

        set_cdrom(&session, &vm, Some("b.iso"), false).await.unwrap();
        assert_eq!(fake.mutations(), vec!["VBD.destroy", "VBD.create"]);
        let record: VmRecord = session.get_record(ObjectKind::Vm, &vm).await.unwrap();
        let (_, vbd, iso) = current_cdrom(&session, &record).await.unwrap().unwrap();
        assert_eq!(iso, "b.iso");
        assert_eq!(vbd.mode, VbdMode::ReadOnly);
    }
}
