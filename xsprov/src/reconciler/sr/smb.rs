//! SMB storage repositories. Locations use UNC form, `\\server\share`,
//! optionally followed by a path inside the share for ISO libraries.

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

fn default_type() -> String {
    "smb".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmbSrConfig {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    #[serde(rename = "type", default = "default_type")]
    pub sr_type: String,
    pub storage_location: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// The password is never read back; it lives in a secret after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmbSrState {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    pub storage_location: String,
    pub username: String,
}

fn validate(config: &SmbSrConfig) -> Result<()> {
    if config.name_label.is_empty() {
        return Err(ProviderError::invalid("name_label", "", "must not be empty"));
    }
    if !matches!(config.sr_type.as_str(), "smb" | "iso") {
        return Err(ProviderError::invalid("type", &config.sr_type, "expected \"smb\" or \"iso\""));
    }
    if config.storage_location.trim().is_empty() {
        return Err(ProviderError::invalid("storage_location", "", "must not be empty"));
    }
    Ok(())
}

fn device_config(config: &SmbSrConfig) -> StringMap {
    let location = config.storage_location.trim();
    let username = config.username.trim();
    let password = config.password.trim();
    let mut device_config = StringMap::new();
    let password_key = if config.sr_type == "iso" {
        let share = location.split(':').next().unwrap_or_default().replace('\\', "/");
        let bits: Vec<&str> = share.split('/').collect();
        if bits.len() > 4 {
            device_config.insert("location".into(), format!("//{}/{}", bits[2], bits[3]));
            device_config.insert("iso_path".into(), format!("/{}", bits[4..].join("/")));
        } else {
            device_config.insert("location".into(), share.clone());
        }
        device_config.insert("type".into(), "cifs".into());
        "cifspassword"
    } else {
        let mut parts = location.split(':');
        device_config.insert("server".into(), parts.next().unwrap_or_default().to_string());
        if let Some(path) = parts.next() {
            device_config.insert("serverpath".into(), path.to_string());
        }
        "password"
    };
    if !username.is_empty() {
        device_config.insert("username".into(), username.to_string());
    }
    if !password.is_empty() {
        device_config.insert(password_key.into(), password.to_string());
    }
    device_config
}

/// Rebuild the declared location from a PBD device config.
fn storage_location(sr_type: &str, device_config: &StringMap) -> Option<String> {
    if sr_type == "iso" {
        let mut location = device_config.get("location")?.clone();
        if let Some(path) = device_config.get("iso_path") {
            location.push_str(path);
        }
        Some(location.replace('/', "\\"))
    } else {
        let server = device_config.get("server")?;
        Some(match device_config.get("serverpath") {
            Some(path) if !path.is_empty() => format!("{server}:{path}"),
            _ => server.clone(),
        })
    }
}

/// Reconciles [`SmbSrConfig`].
#[derive(Debug, Clone, Default)]
pub struct SmbSrReconciler;

impl SmbSrReconciler {
    async fn read_sr(&self, session: &Session, sr: &OpaqueRef) -> Result<SmbSrState> {
        let (record, pbd) = sr_and_pbd(session, sr).await?;
        let storage_location =
            storage_location(&record.sr_type, &pbd.device_config).ok_or_else(|| ProviderError::NotFound {
                what: "PBD device config key",
                detail: format!("share location on SR {}", record.uuid),
            })?;
        Ok(SmbSrState {
            storage_location,
            username: pbd.device_config.get("username").cloned().unwrap_or_default(),
            uuid: record.uuid,
            name_label: record.name_label,
            name_description: record.name_description,
            sr_type: record.sr_type,
        })
    }
}

#[async_trait]
impl Reconciler for SmbSrReconciler {
    type Config = SmbSrConfig;
    type State = SmbSrState;

    async fn create(&self, ctx: &ProviderContext, config: &SmbSrConfig) -> Result<SmbSrState> {
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

    async fn read(&self, ctx: &ProviderContext, state: &SmbSrState) -> Result<SmbSrState> {
        let sr = ref_of(&ctx.session, ObjectKind::Sr, &state.uuid).await?;
        self.read_sr(&ctx.session, &sr).await
    }

    async fn update(&self, ctx: &ProviderContext, config: &SmbSrConfig, state: &SmbSrState) -> Result<SmbSrState> {
        validate(config)?;
        ensure_unchanged("SMB SR", "type", &config.sr_type, &state.sr_type)?;
        ensure_unchanged(
            "SMB SR",
            "storage_location",
            config.storage_location.trim(),
            state.storage_location.trim(),
        )?;

        let session = &ctx.session;
        let sr = ref_of(session, ObjectKind::Sr, &state.uuid).await?;
        let record: SrRecord = session
            .get_record(ObjectKind::Sr, &sr)
            .await
            .remote("SR.get_record", &state.uuid)?;
        rename_sr(session, &sr, &record, &config.name_label, &config.name_description).await?;
        self.read_sr(session, &sr).await
    }

    async fn delete(&self, ctx: &ProviderContext, state: &SmbSrState) -> Result<()> {
        delete_sr(&ctx.session, &state.uuid).await
    }
}
