//! NFS storage repositories, for VM disks (`type = "nfs"`) or ISO images
//! (`type = "iso"`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{NewSr, create_sr, delete_sr, rename_sr, sr_and_pbd};
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::reconciler::pool::coordinator;
use crate::reconciler::{Reconciler, ensure_unchanged};
use crate::resolve::ref_of;
use crate::xapi::records::{SrRecord, StringMap};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

const VERSIONS: [&str; 2] = ["3", "4"];

fn default_type() -> String {
    "nfs".to_string()
}

fn default_version() -> String {
    "3".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsSrConfig {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    #[serde(rename = "type", default = "default_type")]
    pub sr_type: String,
    /// `server:/path`, or the share URL for ISO libraries.
    pub storage_location: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub advanced_options: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsSrState {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    pub storage_location: String,
    pub version: String,
    pub advanced_options: String,
}

fn validate(config: &NfsSrConfig) -> Result<()> {
    if config.name_label.is_empty() {
        return Err(ProviderError::invalid("name_label", "", "must not be empty"));
    }
    if !matches!(config.sr_type.as_str(), "nfs" | "iso") {
        return Err(ProviderError::invalid("type", &config.sr_type, "expected \"nfs\" or \"iso\""));
    }
    if config.storage_location.trim().is_empty() {
        return Err(ProviderError::invalid("storage_location", "", "must not be empty"));
    }
    if !VERSIONS.contains(&config.version.as_str()) {
        return Err(ProviderError::invalid("version", &config.version, "expected \"3\" or \"4\""));
    }
    Ok(())
}

fn device_config(config: &NfsSrConfig) -> StringMap {
    let location = config.storage_location.trim();
    let mut device_config = StringMap::new();
    if config.sr_type == "iso" {
        device_config.insert("location".into(), location.to_string());
        device_config.insert("type".into(), "nfs_iso".into());
    } else {
        let (server, path) = location.split_once(':').unwrap_or((location, ""));
        device_config.insert("server".into(), server.trim().to_string());
        device_config.insert("serverpath".into(), path.trim().to_string());
    }
    device_config.insert("options".into(), config.advanced_options.clone());
    device_config.insert("nfsversion".into(), config.version.clone());
    device_config
}

fn required<'a>(device_config: &'a StringMap, key: &str, sr: &str) -> Result<&'a str> {
    device_config
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ProviderError::NotFound {
            what: "PBD device config key",
            detail: format!("{key:?} on SR {sr}"),
        })
}

/// Reconciles [`NfsSrConfig`].
#[derive(Debug, Clone, Default)]
pub struct NfsSrReconciler;

impl NfsSrReconciler {
    async fn read_sr(&self, session: &Session, sr: &OpaqueRef) -> Result<NfsSrState> {
        let (record, pbd) = sr_and_pbd(session, sr).await?;
        let config = &pbd.device_config;
        let storage_location = if record.sr_type == "iso" {
            required(config, "location", &record.uuid)?.to_string()
        } else {
            let server = required(config, "server", &record.uuid)?;
            let path = required(config, "serverpath", &record.uuid)?;
            format!("{server}:{path}")
        };
        Ok(NfsSrState {
            version: required(config, "nfsversion", &record.uuid)?.to_string(),
            advanced_options: config.get("options").cloned().unwrap_or_default(),
            storage_location,
            uuid: record.uuid,
            name_label: record.name_label,
            name_description: record.name_description,
            sr_type: record.sr_type,
        })
    }
}

#[async_trait]
impl Reconciler for NfsSrReconciler {
    type Config = NfsSrConfig;
    type State = NfsSrState;

    async fn create(&self, ctx: &ProviderContext, config: &NfsSrConfig) -> Result<NfsSrState> {
        validate(config)?;
        let session = &ctx.session;
        let new_sr = NewSr {
            host: coordinator(session).await?,
            device_config: device_config(config),
            name_label: config.name_label.clone(),
            name_description: config.name_description.clone(),
            sr_type: config.sr_type.clone(),
            content_type: if config.sr_type == "iso" { "iso".into() } else { String::new() },
            shared: true,
            ..Default::default()
        };
        let sr = create_sr(session, new_sr).await?;
        self.read_sr(session, &sr).await
    }

    async fn read(&self, ctx: &ProviderContext, state: &NfsSrState) -> Result<NfsSrState> {
        let sr = ref_of(&ctx.session, ObjectKind::Sr, &state.uuid).await?;
        self.read_sr(&ctx.session, &sr).await
    }

    async fn update(&self, ctx: &ProviderContext, config: &NfsSrConfig, state: &NfsSrState) -> Result<NfsSrState> {
        validate(config)?;
        ensure_unchanged("NFS SR", "type", &config.sr_type, &state.sr_type)?;
        ensure_unchanged(
            "NFS SR",
            "storage_location",
            config.storage_location.trim(),
            state.storage_location.trim(),
        )?;
        ensure_unchanged("NFS SR", "version", &config.version, &state.version)?;
        ensure_unchanged("NFS SR", "advanced_options", &config.advanced_options, &state.advanced_options)?;

        let session = &ctx.session;
        let sr = ref_of(session, ObjectKind::Sr, &state.uuid).await?;
        let record: SrRecord = session
            .get_record(ObjectKind::Sr, &sr)
            .await
            .remote("SR.get_record", &state.uuid)?;
        rename_sr(session, &sr, &record, &config.name_label, &config.name_description).await?;
        self.read_sr(session, &sr).await
    }

    async fn delete(&self, ctx: &ProviderContext, state: &NfsSrState) -> Result<()> {
        delete_sr(&ctx.session, &state.uuid).await
    }
}
