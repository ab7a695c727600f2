//! Virtual disk images, optionally populated from a local image file.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Reconciler, ensure_unchanged, ignore_gone};
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::import::{ImageInfo, ImportPipeline, inspect};
use crate::resolve::{find_ref, ref_of, uuid_of};
use crate::retry::{RetryPolicy, retry_if};
use crate::xapi::records::{StringMap, VdiRecord};
use crate::xapi::{ObjectKind, OpaqueRef, Session, codes};

/// Key the importer leaves in `other_config`.
const CONTENT_ID: &str = "content_id";

fn default_vdi_type() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiConfig {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    pub sr_uuid: String,
    /// Bytes. Taken from the image when `raw_vdi_path` is set.
    #[serde(default)]
    pub virtual_size: Option<i64>,
    #[serde(default)]
    pub raw_vdi_path: Option<PathBuf>,
    #[serde(rename = "type", default = "default_vdi_type")]
    pub vdi_type: String,
    #[serde(default)]
    pub sharable: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub other_config: StringMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiState {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub sr_uuid: String,
    pub virtual_size: i64,
    #[serde(default)]
    pub raw_vdi_path: Option<PathBuf>,
    #[serde(rename = "type")]
    pub vdi_type: String,
    pub sharable: bool,
    pub read_only: bool,
    pub other_config: StringMap,
}

fn validate(config: &VdiConfig) -> Result<()> {
    if config.name_label.is_empty() {
        return Err(ProviderError::invalid("name_label", "", "must not be empty"));
    }
    match (&config.raw_vdi_path, config.virtual_size) {
        (None, None) => Err(ProviderError::invalid(
            "virtual_size",
            "",
            "required unless raw_vdi_path is set",
        )),
        (None, Some(size)) if size <= 0 => {
            Err(ProviderError::invalid("virtual_size", size, "must be positive"))
        }
        (Some(path), Some(_)) => Err(ProviderError::invalid(
            "virtual_size",
            path.display(),
            "is taken from the image when raw_vdi_path is set",
        )),
        (Some(_), None) if config.vdi_type != "user" || config.sharable || config.read_only => {
            Err(ProviderError::invalid(
                "raw_vdi_path",
                &config.vdi_type,
                "imported disks are always writable, non-sharable user disks",
            ))
        }
        _ => Ok(()),
    }
}

fn validate_update(config: &VdiConfig, state: &VdiState) -> Result<()> {
    validate(config)?;
    ensure_unchanged("VDI", "sr_uuid", &config.sr_uuid, &state.sr_uuid)?;
    if let Some(size) = config.virtual_size {
        ensure_unchanged("VDI", "virtual_size", &size, &state.virtual_size)?;
    }
    ensure_unchanged("VDI", "raw_vdi_path", &config.raw_vdi_path, &state.raw_vdi_path)?;
    ensure_unchanged("VDI", "type", &config.vdi_type, &state.vdi_type)?;
    ensure_unchanged("VDI", "sharable", &config.sharable, &state.sharable)?;
    ensure_unchanged("VDI", "read_only", &config.read_only, &state.read_only)
}

fn new_record(config: &VdiConfig, sr: OpaqueRef, image: Option<&ImageInfo>) -> Result<VdiRecord> {
    let virtual_size = match image {
        Some(image) => i64::try_from(image.virtual_size).map_err(|_| {
            ProviderError::invalid(
                "raw_vdi_path",
                image.path.display(),
                format!("image reports an impossible virtual size of {} bytes", image.virtual_size),
            )
        })?,
        None => config.virtual_size.unwrap_or_default(),
    };
    Ok(VdiRecord {
        name_label: config.name_label.clone(),
        name_description: config.name_description.clone(),
        sr,
        virtual_size,
        vdi_type: config.vdi_type.clone(),
        sharable: config.sharable,
        read_only: config.read_only,
        other_config: config.other_config.clone(),
        ..Default::default()
    })
}

pub(crate) async fn read_vdi(session: &Session, vdi: &OpaqueRef, raw_vdi_path: Option<PathBuf>) -> Result<VdiState> {
    let mut record: VdiRecord = session
        .get_record(ObjectKind::Vdi, vdi)
        .await
        .remote("VDI.get_record", vdi)?;
    record.other_config.remove(CONTENT_ID);
    Ok(VdiState {
        sr_uuid: uuid_of(session, ObjectKind::Sr, &record.sr).await?,
        uuid: record.uuid,
        name_label: record.name_label,
        name_description: record.name_description,
        virtual_size: record.virtual_size,
        raw_vdi_path,
        vdi_type: record.vdi_type,
        sharable: record.sharable,
        read_only: record.read_only,
        other_config: record.other_config,
    })
}

/// Reconciles [`VdiConfig`].
#[derive(Debug, Clone)]
pub struct VdiReconciler {
    pub import: ImportPipeline,
    /// Retrying destroys that fail with `VDI_IN_USE`.
    pub destroy_retry: RetryPolicy,
}

impl Default for VdiReconciler {
    fn default() -> Self {
        Self {
            import: ImportPipeline::default(),
            destroy_retry: RetryPolicy::fixed(Duration::from_secs(5), 10),
        }
    }
}

impl VdiReconciler {
    /// Destroy `vdi`, waiting out a backend that still holds it open.
    pub async fn destroy(&self, session: &Session, cancel: &CancellationToken, vdi: &OpaqueRef) -> Result<()> {
        retry_if(
            &self.destroy_retry,
            cancel,
            "VDI destroy",
            |e| e.xapi().is_some_and(|x| x.is_code(codes::VDI_IN_USE)),
            || async move {
                ignore_gone(session.destroy(ObjectKind::Vdi, vdi).await).remote("VDI.destroy", vdi)
            },
        )
        .await?;
        debug!(vdi = %vdi, "destroyed VDI");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VdiReconciler {
    type Config = VdiConfig;
    type State = VdiState;

    async fn create(&self, ctx: &ProviderContext, config: &VdiConfig) -> Result<VdiState> {
        validate(config)?;
        let session = &ctx.session;
        let sr = ref_of(session, ObjectKind::Sr, &config.sr_uuid).await?;
        let image = match &config.raw_vdi_path {
            Some(path) => Some(inspect(path).await?),
            None => None,
        };

        let record = new_record(config, sr, image.as_ref())?;
        let vdi = session
            .create(ObjectKind::Vdi, &record)
            .await
            .remote("VDI.create", &config.sr_uuid)?;
        info!(vdi = %vdi, sr = %config.sr_uuid, size = record.virtual_size, "created VDI");

        if let Some(image) = &image
            && let Err(e) = self.import.run(ctx, &vdi, image).await
        {
            warn!(vdi = %vdi, error = %e, "import failed, destroying the VDI");
            // The operation token may be what failed the import.
            let detached = CancellationToken::new();
            return Err(match self.destroy(session, &detached, &vdi).await {
                Ok(()) => e,
                Err(cleanup) => ProviderError::cleanup_failed(e, cleanup),
            });
        }
        read_vdi(session, &vdi, config.raw_vdi_path.clone()).await
    }

    async fn read(&self, ctx: &ProviderContext, state: &VdiState) -> Result<VdiState> {
        let vdi = ref_of(&ctx.session, ObjectKind::Vdi, &state.uuid).await?;
        read_vdi(&ctx.session, &vdi, state.raw_vdi_path.clone()).await
    }

    async fn update(&self, ctx: &ProviderContext, config: &VdiConfig, state: &VdiState) -> Result<VdiState> {
        validate_update(config, state)?;
        let session = &ctx.session;
        let vdi = ref_of(session, ObjectKind::Vdi, &state.uuid).await?;
        let record: VdiRecord = session
            .get_record(ObjectKind::Vdi, &vdi)
            .await
            .remote("VDI.get_record", &state.uuid)?;

        if record.name_label != config.name_label {
            session
                .set_field(ObjectKind::Vdi, &vdi, "name_label", json!(config.name_label))
                .await
                .remote("VDI.set_name_label", &state.uuid)?;
        }
        if record.name_description != config.name_description {
            session
                .set_field(ObjectKind::Vdi, &vdi, "name_description", json!(config.name_description))
                .await
                .remote("VDI.set_name_description", &state.uuid)?;
        }
        let mut other_config = config.other_config.clone();
        if let Some(content_id) = record.other_config.get(CONTENT_ID) {
            other_config.insert(CONTENT_ID.to_string(), content_id.clone());
        }
        if other_config != record.other_config {
            session
                .set_field(ObjectKind::Vdi, &vdi, "other_config", json!(other_config))
                .await
                .remote("VDI.set_other_config", &state.uuid)?;
        }
        read_vdi(session, &vdi, state.raw_vdi_path.clone()).await
    }

    async fn delete(&self, ctx: &ProviderContext, state: &VdiState) -> Result<()> {
        let Some(vdi) = find_ref(&ctx.session, ObjectKind::Vdi, &state.uuid).await? else {
            debug!(vdi = %state.uuid, "VDI already gone");
            return Ok(());
        };
        self.destroy(&ctx.session, &ctx.cancel, &vdi).await?;
        info!(vdi = %state.uuid, "deleted VDI");
        Ok(())
    }
}
