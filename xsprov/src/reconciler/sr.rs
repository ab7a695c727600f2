//! Storage repositories.
//!
//! [`SrReconciler`] takes a raw `device_config`; the [`nfs`] and [`smb`]
//! reconcilers build it from a storage location. All three create the SR on
//! one host, move passwords into a secret, plug every PBD and forget the SR
//! on delete.

pub mod nfs;
pub mod smb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::pool::coordinator;
use super::{Reconciler, ensure_unchanged};
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::resolve::{find_ref, ref_of, uuid_of};
use crate::xapi::records::{PbdRecord, SecretRecord, SrRecord, StringMap};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

/// Device-config keys whose values are stored as secrets.
pub const SECRET_KEYS: [&str; 3] = ["cifspassword", "password", "chappassword"];

const AUTO_SCAN: &str = "auto-scan";

/// Arguments of `SR.create`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewSr {
    pub host: OpaqueRef,
    pub device_config: StringMap,
    pub physical_size: i64,
    pub name_label: String,
    pub name_description: String,
    pub sr_type: String,
    pub content_type: String,
    pub shared: bool,
    pub sm_config: StringMap,
}

/// Replace the first password-like entry with a secret holding its value.
async fn move_password_to_secret(session: &Session, device_config: &mut StringMap) -> Result<Option<OpaqueRef>> {
    let Some(key) = SECRET_KEYS.iter().find(|k| device_config.contains_key(**k)) else {
        return Ok(None);
    };
    let value = device_config.remove(*key).unwrap_or_default();
    let record = SecretRecord {
        value,
        ..Default::default()
    };
    let secret = session
        .create(ObjectKind::Secret, &record)
        .await
        .remote("secret.create", key)?;
    let uuid = uuid_of(session, ObjectKind::Secret, &secret).await?;
    device_config.insert(format!("{key}_secret"), uuid);
    debug!(key, "stored device-config password as a secret");
    Ok(Some(secret))
}

/// Create the SR described by `new_sr` and leave it plugged on every host.
pub async fn create_sr(session: &Session, mut new_sr: NewSr) -> Result<OpaqueRef> {
    let secret = move_password_to_secret(session, &mut new_sr.device_config).await?;
    let created = session
        .invoke(
            "SR.create",
            vec![
                (&new_sr.host).into(),
                json!(new_sr.device_config),
                json!(new_sr.physical_size),
                json!(new_sr.name_label),
                json!(new_sr.name_description),
                json!(new_sr.sr_type),
                json!(new_sr.content_type),
                json!(new_sr.shared),
                json!(new_sr.sm_config),
            ],
        )
        .await
        .remote("SR.create", &new_sr.name_label);
    let sr: OpaqueRef = match (created, secret) {
        (Ok(sr), _) => sr,
        (Err(e), None) => return Err(e),
        (Err(e), Some(secret)) => {
            let cleanup = session
                .destroy(ObjectKind::Secret, &secret)
                .await
                .remote("secret.destroy", &secret);
            return Err(match cleanup {
                Ok(()) => e,
                Err(cleanup) => ProviderError::cleanup_failed(e, cleanup),
            });
        }
    };
    info!(sr = %sr, name = %new_sr.name_label, sr_type = %new_sr.sr_type, "created SR");

    let record: SrRecord = session
        .get_record(ObjectKind::Sr, &sr)
        .await
        .remote("SR.get_record", &sr)?;
    for pbd in &record.pbds {
        let attached: bool = session
            .get_field(ObjectKind::Pbd, pbd, "currently_attached")
            .await
            .remote("PBD.get_currently_attached", pbd)?;
        if !attached {
            session
                .invoke_unit("PBD.plug", vec![pbd.into()])
                .await
                .remote("PBD.plug", pbd)?;
            debug!(pbd = %pbd, "plugged PBD");
        }
    }

    let mut other_config = record.other_config;
    let auto_scan = new_sr.content_type == "iso";
    other_config.insert(AUTO_SCAN.to_string(), auto_scan.to_string());
    session
        .set_field(ObjectKind::Sr, &sr, "other_config", json!(other_config))
        .await
        .remote("SR.set_other_config", &record.uuid)?;
    Ok(sr)
}

/// The SR and its first PBD.
pub async fn sr_and_pbd(session: &Session, sr: &OpaqueRef) -> Result<(SrRecord, PbdRecord)> {
    let record: SrRecord = session
        .get_record(ObjectKind::Sr, sr)
        .await
        .remote("SR.get_record", sr)?;
    let pbd = record.pbds.first().ok_or_else(|| ProviderError::NotFound {
        what: "PBD",
        detail: format!("SR {} has no PBD", record.uuid),
    })?;
    let pbd: PbdRecord = session
        .get_record(ObjectKind::Pbd, pbd)
        .await
        .remote("PBD.get_record", pbd)?;
    Ok((record, pbd))
}

/// Unplug every attached PBD, the coordinator's last, then forget the SR.
pub async fn forget_sr(session: &Session, sr: &OpaqueRef) -> Result<()> {
    let coordinator = coordinator(session).await?;
    let pbds: Vec<OpaqueRef> = session
        .get_field(ObjectKind::Sr, sr, "PBDs")
        .await
        .remote("SR.get_PBDs", sr)?;
    let mut others = Vec::new();
    let mut last = Vec::new();
    for pbd in pbds {
        let record: PbdRecord = session
            .get_record(ObjectKind::Pbd, &pbd)
            .await
            .remote("PBD.get_record", &pbd)?;
        if !record.currently_attached {
            continue;
        }
        if !record.host.is_null() && record.host == coordinator {
            last.push(pbd);
        } else {
            others.push(pbd);
        }
    }
    for pbd in others.iter().chain(&last) {
        session
            .invoke_unit("PBD.unplug", vec![pbd.into()])
            .await
            .remote("PBD.unplug", pbd)?;
        debug!(pbd = %pbd, "unplugged PBD");
    }
    session
        .invoke_unit("SR.forget", vec![sr.into()])
        .await
        .remote("SR.forget", sr)?;
    Ok(())
}

/// Delete the SR with `uuid`, if it still exists.
pub async fn delete_sr(session: &Session, uuid: &str) -> Result<()> {
    let Some(sr) = find_ref(session, ObjectKind::Sr, uuid).await? else {
        debug!(sr = %uuid, "SR already gone");
        return Ok(());
    };
    forget_sr(session, &sr).await?;
    info!(sr = %uuid, "forgot SR");
    Ok(())
}

/// Set name and description where they differ.
pub async fn rename_sr(session: &Session, sr: &OpaqueRef, record: &SrRecord, name_label: &str, name_description: &str) -> Result<()> {
    if record.name_label != name_label {
        session
            .set_field(ObjectKind::Sr, sr, "name_label", json!(name_label))
            .await
            .remote("SR.set_name_label", &record.uuid)?;
    }
    if record.name_description != name_description {
        session
            .set_field(ObjectKind::Sr, sr, "name_description", json!(name_description))
            .await
            .remote("SR.set_name_description", &record.uuid)?;
    }
    Ok(())
}

/// Declared and stored device configs agree once passwords are compared by
/// the presence of their secret.
pub fn device_config_matches(declared: &StringMap, current: &StringMap) -> bool {
    let mut expected = declared.clone();
    for key in SECRET_KEYS {
        if expected.remove(key).is_some() {
            let secret = format!("{key}_secret");
            if !current.contains_key(&secret) {
                return false;
            }
            if let Some(value) = current.get(&secret) {
                expected.insert(secret, value.clone());
            }
        }
    }
    expected == *current
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrConfig {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub sm_config: StringMap,
    #[serde(default)]
    pub device_config: StringMap,
    /// Host UUID; defaults to the coordinator.
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrState {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    pub content_type: String,
    pub shared: bool,
    pub sm_config: StringMap,
    pub device_config: StringMap,
    pub host: String,
}

fn validate(config: &SrConfig) -> Result<()> {
    if config.name_label.is_empty() {
        return Err(ProviderError::invalid("name_label", "", "must not be empty"));
    }
    if config.sr_type.is_empty() {
        return Err(ProviderError::invalid("type", "", "must not be empty"));
    }
    Ok(())
}

/// Reconciles [`SrConfig`].
#[derive(Debug, Clone, Default)]
pub struct SrReconciler;

impl SrReconciler {
    async fn read_sr(&self, session: &Session, sr: &OpaqueRef) -> Result<SrState> {
        let (record, pbd) = sr_and_pbd(session, sr).await?;
        let host = if record.shared {
            coordinator(session).await?
        } else {
            pbd.host
        };
        Ok(SrState {
            host: uuid_of(session, ObjectKind::Host, &host).await?,
            uuid: record.uuid,
            name_label: record.name_label,
            name_description: record.name_description,
            sr_type: record.sr_type,
            content_type: record.content_type,
            shared: record.shared,
            sm_config: record.sm_config,
            device_config: pbd.device_config,
        })
    }
}

#[async_trait]
impl Reconciler for SrReconciler {
    type Config = SrConfig;
    type State = SrState;

    async fn create(&self, ctx: &ProviderContext, config: &SrConfig) -> Result<SrState> {
        validate(config)?;
        let session = &ctx.session;
        let coordinator = coordinator(session).await?;
        let host = match &config.host {
            Some(uuid) => {
                let host = ref_of(session, ObjectKind::Host, uuid).await?;
                if config.shared && host != coordinator {
                    return Err(ProviderError::invalid(
                        "host",
                        uuid,
                        "a shared SR can only be created on the coordinator",
                    ));
                }
                host
            }
            None => coordinator,
        };
        let new_sr = NewSr {
            host,
            device_config: config.device_config.clone(),
            name_label: config.name_label.clone(),
            name_description: config.name_description.clone(),
            sr_type: config.sr_type.clone(),
            content_type: config.content_type.clone(),
            shared: config.shared,
            sm_config: config.sm_config.clone(),
            ..Default::default()
        };
        let sr = create_sr(session, new_sr).await?;
        self.read_sr(session, &sr).await
    }

    async fn read(&self, ctx: &ProviderContext, state: &SrState) -> Result<SrState> {
        let sr = ref_of(&ctx.session, ObjectKind::Sr, &state.uuid).await?;
        self.read_sr(&ctx.session, &sr).await
    }

    async fn update(&self, ctx: &ProviderContext, config: &SrConfig, state: &SrState) -> Result<SrState> {
        validate(config)?;
        ensure_unchanged("SR", "shared", &config.shared, &state.shared)?;
        if let Some(host) = &config.host {
            ensure_unchanged("SR", "host", host, &state.host)?;
        }
        if !device_config_matches(&config.device_config, &state.device_config) {
            return Err(ProviderError::immutable("SR", "device_config"));
        }
        ensure_unchanged("SR", "type", &config.sr_type, &state.sr_type)?;
        ensure_unchanged("SR", "content_type", &config.content_type, &state.content_type)?;

        let session = &ctx.session;
        let sr = ref_of(session, ObjectKind::Sr, &state.uuid).await?;
        let record: SrRecord = session
            .get_record(ObjectKind::Sr, &sr)
            .await
            .remote("SR.get_record", &state.uuid)?;
        rename_sr(session, &sr, &record, &config.name_label, &config.name_description).await?;
        if record.sm_config != config.sm_config {
            session
                .set_field(ObjectKind::Sr, &sr, "sm_config", json!(config.sm_config))
                .await
                .remote("SR.set_sm_config", &state.uuid)?;
        }
        self.read_sr(session, &sr).await
    }

    async fn delete(&self, ctx: &ProviderContext, state: &SrState) -> Result<()> {
        delete_sr(&ctx.session, &state.uuid).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_util::FakeXapi;
    use serde_json::Value;

    /// A coordinator plus a second host, both carrying a pool reference.
    pub(crate) fn two_hosts() -> (FakeXapi, OpaqueRef, OpaqueRef) {
        let fake = FakeXapi::standalone("10.0.0.1", "host-a");
        let coordinator = fake.find_by_uuid(ObjectKind::Host, "host-a").unwrap();
        let other = fake.insert(ObjectKind::Host, json!({"uuid": "host-b", "address": "10.0.0.2"}));
        (fake, coordinator, other)
    }

    fn map(entries: &[(&str, &str)]) -> StringMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config() -> SrConfig {
        SrConfig {
            name_label: "local".into(),
            name_description: String::new(),
            sr_type: "lvm".into(),
            content_type: "user".into(),
            shared: false,
            sm_config: StringMap::new(),
            device_config: map(&[("device", "/dev/sdb")]),
            host: None,
        }
    }

    #[tokio::test]
    async fn local_sr_lands_on_the_named_host() {
        let (fake, _, _) = two_hosts();
        let ctx = fake.context();
        let state = SrReconciler
            .create(&ctx, &SrConfig { host: Some("host-b".into()), ..config() })
            .await
            .unwrap();
        assert_eq!(state.host, "host-b");
        assert_eq!(state.device_config, map(&[("device", "/dev/sdb")]));
        let sr = fake.find_by_uuid(ObjectKind::Sr, &state.uuid).unwrap();
        assert_eq!(fake.record(ObjectKind::Sr, &sr).unwrap()["other_config"]["auto-scan"], "false");
    }

    #[tokio::test]
    async fn shared_sr_on_a_supporter_is_rejected() {
        let (fake, _, _) = two_hosts();
        let ctx = fake.context();
        let shared = SrConfig {
            shared: true,
            host: Some("host-b".into()),
            ..config()
        };
        let err = SrReconciler.create(&ctx, &shared).await.unwrap_err();
        assert_eq!(err.attribute(), Some("host"));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn password_is_moved_into_a_secret() {
        let (fake, _, _) = two_hosts();
        let ctx = fake.context();
        let iscsi = SrConfig {
            sr_type: "lvmoiscsi".into(),
            shared: true,
            device_config: map(&[("target", "10.0.0.9"), ("chappassword", "hunter2")]),
            ..config()
        };
        let state = SrReconciler.create(&ctx, &iscsi).await.unwrap();
        assert!(!state.device_config.contains_key("chappassword"));
        let secret_uuid = &state.device_config["chappassword_secret"];
        let secret = fake.find_by_uuid(ObjectKind::Secret, secret_uuid).unwrap();
        assert_eq!(fake.record(ObjectKind::Secret, &secret).unwrap()["value"], "hunter2");
        assert_eq!(state.host, "host-a");

        // The declared password still matches the stored secret reference.
        fake.clear_calls();
        SrReconciler.update(&ctx, &iscsi, &state).await.unwrap();
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn failed_create_destroys_the_secret() {
        let (fake, _, _) = two_hosts();
        fake.fail("SR.create", "SR_BACKEND_FAILURE_140", &["target unreachable"]);
        let ctx = fake.context();
        let iscsi = SrConfig {
            device_config: map(&[("chappassword", "hunter2")]),
            ..config()
        };
        let err = SrReconciler.create(&ctx, &iscsi).await.unwrap_err();
        assert!(err.to_string().contains("SR_BACKEND_FAILURE_140"));
        assert_eq!(fake.count(ObjectKind::Secret), 0);

        fake.fail("secret.destroy", "HANDLE_INVALID", &["secret"]);
        let err = SrReconciler.create(&ctx, &iscsi).await.unwrap_err();
        assert!(matches!(err, ProviderError::CleanupFailed { .. }));
    }

    #[tokio::test]
    async fn immutable_fields_fail_without_mutations() {
        let (fake, _, _) = two_hosts();
        let ctx = fake.context();
        let state = SrReconciler.create(&ctx, &config()).await.unwrap();
        fake.clear_calls();

        for (changed, field) in [
            (SrConfig { shared: true, ..config() }, "shared"),
            (SrConfig { host: Some("host-b".into()), ..config() }, "host"),
            (SrConfig { device_config: map(&[("device", "/dev/sdc")]), ..config() }, "device_config"),
            (SrConfig { sr_type: "ext".into(), ..config() }, "type"),
            (SrConfig { content_type: "iso".into(), ..config() }, "content_type"),
        ] {
            let err = SrReconciler.update(&ctx, &changed, &state).await.unwrap_err();
            assert_eq!(err.attribute(), Some(field));
        }
        assert!(fake.mutations().is_empty());

        let renamed = SrConfig { name_label: "scratch".into(), ..config() };
        let state = SrReconciler.update(&ctx, &renamed, &state).await.unwrap();
        assert_eq!(state.name_label, "scratch");
        assert_eq!(fake.mutations(), vec!["SR.set_name_label"]);
    }

    #[tokio::test]
    async fn delete_unplugs_the_coordinator_last() {
        let (fake, _, other) = two_hosts();
        let ctx = fake.context();
        let state = SrReconciler
            .create(&ctx, &SrConfig { shared: true, ..config() })
            .await
            .unwrap();
        let sr = fake.find_by_uuid(ObjectKind::Sr, &state.uuid).unwrap();
        let on_coordinator = fake.record(ObjectKind::Sr, &sr).unwrap()["PBDs"][0].clone();
        let on_supporter = fake.insert(
            ObjectKind::Pbd,
            json!({"SR": sr, "host": other, "currently_attached": true}),
        );
        fake.clear_calls();

        SrReconciler.delete(&ctx, &state).await.unwrap();
        let unplugged: Vec<Value> = fake
            .calls_to("PBD.unplug")
            .iter()
            .filter_map(|c| c.arg(0).cloned())
            .collect();
        assert_eq!(unplugged, vec![json!(on_supporter), on_coordinator]);
        assert!(fake.find_by_uuid(ObjectKind::Sr, &state.uuid).is_none());
        assert_eq!(fake.count(ObjectKind::Pbd), 0);

        // Already gone.
        SrReconciler.delete(&ctx, &state).await.unwrap();
    }
}
