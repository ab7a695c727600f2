//! Reference/UUID resolution.
//!
//! One resolver for every object kind: a NULL or empty reference resolves to
//! an empty UUID without touching the gateway.

use crate::error::{ProviderError, RemoteContext, Result};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

/// UUID of `reference`, or `""` for the NULL reference.
pub async fn uuid_of(session: &Session, kind: ObjectKind, reference: &OpaqueRef) -> Result<String> {
    if reference.is_null() {
        return Ok(String::new());
    }
    session
        .get_uuid(kind, reference)
        .await
        .map_err(|source| ProviderError::Resolve {
            kind,
            reference: reference.to_string(),
            source,
        })
}

/// UUIDs of `references` in order, skipping NULL entries.
pub async fn uuids_of(
    session: &Session,
    kind: ObjectKind,
    references: &[OpaqueRef],
) -> Result<Vec<String>> {
    let mut uuids = Vec::with_capacity(references.len());
    for reference in references.iter().filter(|r| !r.is_null()) {
        uuids.push(uuid_of(session, kind, reference).await?);
    }
    Ok(uuids)
}

/// Reference of the object with `uuid`.
pub async fn ref_of(session: &Session, kind: ObjectKind, uuid: &str) -> Result<OpaqueRef> {
    session
        .get_by_uuid(kind, uuid)
        .await
        .remote(&kind.method("get_by_uuid"), uuid)
}

/// Like [`ref_of`], but `None` when no object has that UUID.
pub async fn find_ref(session: &Session, kind: ObjectKind, uuid: &str) -> Result<Option<OpaqueRef>> {
    match session.get_by_uuid(kind, uuid).await {
        Ok(reference) => Ok(Some(reference)),
        Err(e) if e.is_gone() => Ok(None),
        Err(e) => Err(e).remote(&kind.method("get_by_uuid"), uuid),
    }
}
