//! VM snapshots and checkpoints.
//!
//! Reverting replaces every disk of the snapshotted VM with a fresh VDI, so
//! the state carries the new disk identities in `revert_vdis` for whoever
//! tracks those disks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::vdi::{VdiState, read_vdi};
use super::{Reconciler, ensure_unchanged, ignore_gone, vbd};
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::resolve::{find_ref, ref_of, uuid_of};
use crate::xapi::records::{PowerState, SrRecord, VmRecord};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

/// `snapshot_info` key holding the VM's power state when it was snapshotted.
const POWER_STATE_AT_SNAPSHOT: &str = "power-state-at-snapshot";

/// SR types a checkpoint may fall back to for its memory image.
const SUSPEND_SR_TYPES: [&str; 2] = ["nfs", "lvm"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub name_label: String,
    pub vm_uuid: String,
    /// Checkpoint the running VM's memory along with its disks.
    #[serde(default)]
    pub with_memory: bool,
    /// Roll the VM back to this snapshot when the flag is turned on.
    #[serde(default)]
    pub revert: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub uuid: String,
    pub name_label: String,
    pub vm_uuid: String,
    pub with_memory: bool,
    #[serde(default)]
    pub revert: bool,
    /// Disks of the VM after a revert.
    #[serde(default)]
    pub revert_vdis: Vec<VdiState>,
}

fn validate(config: &SnapshotConfig) -> Result<()> {
    if config.name_label.is_empty() {
        return Err(ProviderError::invalid("name_label", "", "must not be empty"));
    }
    if config.vm_uuid.is_empty() {
        return Err(ProviderError::invalid("vm_uuid", "", "must not be empty"));
    }
    Ok(())
}

/// Non-NULL VDIs behind the disk VBDs of `vm`.
async fn disk_vdis(session: &Session, vm: &VmRecord) -> Result<Vec<OpaqueRef>> {
    Ok(vbd::disk_vbds(session, vm)
        .await?
        .into_iter()
        .map(|(_, record)| record.vdi)
        .filter(|vdi| !vdi.is_null())
        .collect())
}

/// SR for the checkpoint's memory image: the VM's own suspend SR, else the
/// pool default SR, else the first NFS or LVM SR. The choice is stored on
/// the VM.
async fn ensure_suspend_sr(session: &Session, vm: &OpaqueRef, record: &VmRecord) -> Result<OpaqueRef> {
    if !record.suspend_sr.is_null() {
        return Ok(record.suspend_sr.clone());
    }
    let mut sr = OpaqueRef::null();
    let pools = session
        .get_all(ObjectKind::Pool)
        .await
        .remote("pool.get_all", session.base_url())?;
    if let Some(pool) = pools.first() {
        sr = session
            .get_field(ObjectKind::Pool, pool, "default_SR")
            .await
            .remote("pool.get_default_SR", pool)?;
    }
    if sr.is_null() {
        let srs = session
            .get_all_records::<SrRecord>(ObjectKind::Sr)
            .await
            .remote("SR.get_all_records", session.base_url())?;
        sr = srs
            .into_iter()
            .find(|(_, r)| SUSPEND_SR_TYPES.contains(&r.sr_type.as_str()))
            .map(|(reference, _)| reference)
            .ok_or_else(|| ProviderError::NotFound {
                what: "suspend SR",
                detail: format!("no default SR and no nfs or lvm SR for VM {}", record.uuid),
            })?;
    }
    session
        .set_field(ObjectKind::Vm, vm, "suspend_SR", json!(sr))
        .await
        .remote("VM.set_suspend_SR", &record.uuid)?;
    debug!(vm = %record.uuid, sr = %sr, "set suspend SR");
    Ok(sr)
}

/// Bring the VM back to the power state it had when it was snapshotted.
async fn restore_power_state(session: &Session, snapshot: &VmRecord) -> Result<()> {
    let was_running = snapshot
        .snapshot_info
        .get(POWER_STATE_AT_SNAPSHOT)
        .is_some_and(|state| state == "Running");
    if !was_running {
        return Ok(());
    }
    let vm = &snapshot.snapshot_of;
    let record: VmRecord = session
        .get_record(ObjectKind::Vm, vm)
        .await
        .remote("VM.get_record", vm)?;
    let host = &record.resident_on;
    let can_boot_here = !host.is_null()
        && session
            .invoke_unit("VM.assert_can_boot_here", vec![vm.into(), host.into()])
            .await
            .is_ok();

    let (method, args) = match (record.power_state, can_boot_here) {
        (PowerState::Halted, true) => ("VM.start_on", vec![vm.into(), host.into(), json!(false), json!(false)]),
        (PowerState::Halted, false) => ("VM.start", vec![vm.into(), json!(false), json!(false)]),
        (PowerState::Suspended, true) => ("VM.resume_on", vec![vm.into(), host.into(), json!(false), json!(false)]),
        (PowerState::Suspended, false) => ("VM.resume", vec![vm.into(), json!(false), json!(false)]),
        _ => return Ok(()),
    };
    session.invoke_unit(method, args).await.remote(method, &record.uuid)?;
    info!(vm = %record.uuid, method, "restored power state after revert");
    Ok(())
}

/// Reconciles [`SnapshotConfig`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotReconciler;

impl SnapshotReconciler {
    async fn read_snapshot(&self, session: &Session, snapshot: &OpaqueRef, revert: bool) -> Result<SnapshotState> {
        let record: VmRecord = session
            .get_record(ObjectKind::Vm, snapshot)
            .await
            .remote("VM.get_record", snapshot)?;
        let mut revert_vdis = Vec::new();
        if revert {
            let vm: VmRecord = session
                .get_record(ObjectKind::Vm, &record.snapshot_of)
                .await
                .remote("VM.get_record", &record.snapshot_of)?;
            for vdi in disk_vdis(session, &vm).await? {
                revert_vdis.push(read_vdi(session, &vdi, None).await?);
            }
        }
        Ok(SnapshotState {
            vm_uuid: uuid_of(session, ObjectKind::Vm, &record.snapshot_of).await?,
            uuid: record.uuid,
            name_label: record.name_label,
            with_memory: record.power_state == PowerState::Suspended,
            revert,
            revert_vdis,
        })
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    type Config = SnapshotConfig;
    type State = SnapshotState;

    async fn create(&self, ctx: &ProviderContext, config: &SnapshotConfig) -> Result<SnapshotState> {
        validate(config)?;
        let session = &ctx.session;
        let vm = ref_of(session, ObjectKind::Vm, &config.vm_uuid).await?;

        let snapshot: OpaqueRef = if config.with_memory {
            let record: VmRecord = session
                .get_record(ObjectKind::Vm, &vm)
                .await
                .remote("VM.get_record", &config.vm_uuid)?;
            if record.power_state != PowerState::Running {
                return Err(ProviderError::invalid(
                    "with_memory",
                    &config.vm_uuid,
                    format!("VM must be running to checkpoint it, it is {:?}", record.power_state),
                ));
            }
            ensure_suspend_sr(session, &vm, &record).await?;
            session
                .invoke("VM.checkpoint", vec![(&vm).into(), json!(config.name_label)])
                .await
                .remote("VM.checkpoint", &config.vm_uuid)?
        } else {
            session
                .invoke("VM.snapshot", vec![(&vm).into(), json!(config.name_label), json!([])])
                .await
                .remote("VM.snapshot", &config.vm_uuid)?
        };
        let state = self.read_snapshot(session, &snapshot, false).await?;
        info!(
            snapshot = %state.uuid,
            vm = %config.vm_uuid,
            with_memory = config.with_memory,
            "created snapshot"
        );
        Ok(state)
    }

    async fn read(&self, ctx: &ProviderContext, state: &SnapshotState) -> Result<SnapshotState> {
        let snapshot = ref_of(&ctx.session, ObjectKind::Vm, &state.uuid).await?;
        self.read_snapshot(&ctx.session, &snapshot, state.revert).await
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        config: &SnapshotConfig,
        state: &SnapshotState,
    ) -> Result<SnapshotState> {
        validate(config)?;
        ensure_unchanged("snapshot", "vm_uuid", &config.vm_uuid, &state.vm_uuid)?;
        ensure_unchanged("snapshot", "with_memory", &config.with_memory, &state.with_memory)?;

        let session = &ctx.session;
        let snapshot = ref_of(session, ObjectKind::Vm, &state.uuid).await?;
        if config.name_label != state.name_label {
            session
                .set_field(ObjectKind::Vm, &snapshot, "name_label", json!(config.name_label))
                .await
                .remote("VM.set_name_label", &state.uuid)?;
        }
        if config.revert && !state.revert {
            let record: VmRecord = session
                .get_record(ObjectKind::Vm, &snapshot)
                .await
                .remote("VM.get_record", &state.uuid)?;
            session
                .invoke_unit("VM.revert", vec![(&snapshot).into()])
                .await
                .remote("VM.revert", &state.uuid)?;
            info!(snapshot = %state.uuid, vm = %state.vm_uuid, "reverted VM to snapshot");
            restore_power_state(session, &record).await?;
        }
        self.read_snapshot(session, &snapshot, config.revert).await
    }

    async fn delete(&self, ctx: &ProviderContext, state: &SnapshotState) -> Result<()> {
        let session = &ctx.session;
        let Some(snapshot) = find_ref(session, ObjectKind::Vm, &state.uuid).await? else {
            debug!(snapshot = %state.uuid, "snapshot already gone");
            return Ok(());
        };
        let record: VmRecord = session
            .get_record(ObjectKind::Vm, &snapshot)
            .await
            .remote("VM.get_record", &state.uuid)?;
        if record.power_state == PowerState::Suspended {
            session
                .invoke_unit("VM.hard_shutdown", vec![(&snapshot).into()])
                .await
                .remote("VM.hard_shutdown", &state.uuid)?;
        }
        for vdi in disk_vdis(session, &record).await? {
            ignore_gone(session.destroy(ObjectKind::Vdi, &vdi).await).remote("VDI.destroy", &vdi)?;
        }
        session
            .destroy(ObjectKind::Vm, &snapshot)
            .await
            .remote("VM.destroy", &state.uuid)?;
        info!(snapshot = %state.uuid, "deleted snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeXapi;

    fn fixture(power_state: &str) -> FakeXapi {
        let fake = FakeXapi::new();
        let sr = fake.insert(ObjectKind::Sr, json!({"uuid": "sr-nfs", "type": "nfs"}));
        let disk = fake.insert(ObjectKind::Vdi, json!({"uuid": "disk-0", "name_label": "root", "SR": sr}));
        let vm = fake.insert(ObjectKind::Vm, json!({"uuid": "vm-1", "power_state": power_state}));
        fake.insert(ObjectKind::Vbd, json!({"VM": vm, "VDI": disk, "userdevice": "0"}));
        fake.insert(ObjectKind::Pool, json!({"uuid": "pool-1"}));
        fake
    }

    fn config(with_memory: bool) -> SnapshotConfig {
        SnapshotConfig {
            name_label: "before-upgrade".into(),
            vm_uuid: "vm-1".into(),
            with_memory,
            revert: false,
        }
    }

    #[tokio::test]
    async fn plain_snapshot_of_a_halted_vm() {
        let fake = fixture("Halted");
        let ctx = fake.context();
        let state = SnapshotReconciler.create(&ctx, &config(false)).await.unwrap();
        assert_eq!(state.vm_uuid, "vm-1");
        assert!(!state.with_memory);
        assert!(state.revert_vdis.is_empty());
        assert_eq!(fake.mutations(), vec!["VM.snapshot"]);
    }

    #[tokio::test]
    async fn checkpoint_needs_a_running_vm() {
        let fake = fixture("Halted");
        let ctx = fake.context();
        let err = SnapshotReconciler.create(&ctx, &config(true)).await.unwrap_err();
        assert_eq!(err.attribute(), Some("with_memory"));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_falls_back_to_an_nfs_suspend_sr() {
        let fake = fixture("Running");
        let ctx = fake.context();
        let state = SnapshotReconciler.create(&ctx, &config(true)).await.unwrap();
        assert!(state.with_memory);
        assert_eq!(fake.mutations(), vec!["VM.set_suspend_SR", "VM.checkpoint"]);
        let vm = fake.find_by_uuid(ObjectKind::Vm, "vm-1").unwrap();
        let sr = fake.find_by_uuid(ObjectKind::Sr, "sr-nfs").unwrap();
        assert_eq!(fake.record(ObjectKind::Vm, &vm).unwrap()["suspend_SR"], sr.as_str());
    }

    #[tokio::test]
    async fn vm_and_memory_flag_are_immutable() {
        let fake = fixture("Halted");
        let ctx = fake.context();
        let state = SnapshotReconciler.create(&ctx, &config(false)).await.unwrap();
        fake.clear_calls();

        let moved = SnapshotConfig { vm_uuid: "vm-2".into(), ..config(false) };
        let err = SnapshotReconciler.update(&ctx, &moved, &state).await.unwrap_err();
        assert_eq!(err.attribute(), Some("vm_uuid"));
        let err = SnapshotReconciler.update(&ctx, &config(true), &state).await.unwrap_err();
        assert_eq!(err.attribute(), Some("with_memory"));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn revert_restarts_the_vm_and_reports_new_disks() {
        let fake = fixture("Running");
        let ctx = fake.context();
        let state = SnapshotReconciler.create(&ctx, &config(false)).await.unwrap();
        fake.clear_calls();

        let revert = SnapshotConfig { revert: true, ..config(false) };
        let reverted = SnapshotReconciler.update(&ctx, &revert, &state).await.unwrap();
        assert_eq!(fake.mutations(), vec!["VM.revert", "VM.start"]);
        assert_eq!(reverted.revert_vdis.len(), 1);
        assert_ne!(reverted.revert_vdis[0].uuid, "disk-0");
        assert_eq!(reverted.revert_vdis[0].sr_uuid, "sr-nfs");

        let vm = fake.find_by_uuid(ObjectKind::Vm, "vm-1").unwrap();
        assert_eq!(fake.record(ObjectKind::Vm, &vm).unwrap()["power_state"], "Running");

        // Already reverted; a rename does not revert again.
        fake.clear_calls();
        let renamed = SnapshotConfig { name_label: "kept".into(), ..revert };
        SnapshotReconciler.update(&ctx, &renamed, &reverted).await.unwrap();
        assert_eq!(fake.mutations(), vec!["VM.set_name_label"]);
    }

    #[tokio::test]
    async fn delete_shuts_down_a_checkpoint_and_drops_its_disks() {
        let fake = fixture("Running");
        let ctx = fake.context();
        let state = SnapshotReconciler.create(&ctx, &config(true)).await.unwrap();
        assert_eq!(fake.count(ObjectKind::Vdi), 2);
        fake.clear_calls();

        SnapshotReconciler.delete(&ctx, &state).await.unwrap();
        assert_eq!(fake.mutations(), vec!["VM.hard_shutdown", "VDI.destroy", "VM.destroy"]);
        assert_eq!(fake.count(ObjectKind::Vdi), 1);
        assert!(fake.find_by_uuid(ObjectKind::Vm, &state.uuid).is_none());

        SnapshotReconciler.delete(&ctx, &state).await.unwrap();
    }
}
