//! Pool reconciler: supporter joins and ejects plus pool-wide settings.
//!
//! Every change is planned before the first mutation. Planning logs in to
//! each join candidate, classifies it (standalone, already a member, member
//! of another pool), resolves eject targets and checks the default SR and
//! management network, so conflicting or invalid intent fails without any
//! remote state having changed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::resolve::{find_ref, ref_of, uuid_of, uuids_of};
use crate::retry::{RetryPolicy, pause, retry};
use crate::xapi::records::{HostRecord, PifRecord, PoolRecord};
use crate::xapi::{ObjectKind, OpaqueRef, Session, codes, host_address};

/// Credentials of a host that should join the pool.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSupporter {
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for JoinSupporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinSupporter")
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    /// UUID of a shared SR.
    #[serde(default)]
    pub default_sr: Option<String>,
    /// Network UUID; the management interface moves only when this differs
    /// from the current one.
    #[serde(default)]
    pub management_network: Option<String>,
    #[serde(default)]
    pub join_supporters: Vec<JoinSupporter>,
    /// Host UUIDs.
    #[serde(default)]
    pub eject_supporters: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub default_sr: String,
    pub management_network: String,
    #[serde(default)]
    pub join_supporters: Vec<JoinSupporter>,
    #[serde(default)]
    pub eject_supporters: BTreeSet<String>,
    /// UUIDs of the non-coordinator members.
    #[serde(default)]
    pub supporters: Vec<String>,
}

/// Where a host stands relative to the pool being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    /// Sole host of its own pool; will be joined.
    Standalone,
    /// Join issued, not yet live.
    PendingJoin,
    Member,
    /// Member that will be ejected.
    PendingEject,
    /// Not part of the pool; nothing to eject.
    NotMember,
}

/// One host the plan looked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedHost {
    /// Address for join candidates, UUID for eject targets.
    pub host: String,
    /// Empty when the host could not be asked (it is already a supporter).
    pub uuid: String,
    pub state: MembershipState,
}

struct Candidate {
    uuid: String,
    address: String,
    session: Session,
}

/// Read-only outcome of planning a membership change.
#[derive(Default)]
pub struct MembershipPlan {
    pub hosts: Vec<PlannedHost>,
    joins: Vec<Candidate>,
    ejects: Vec<String>,
}

impl MembershipPlan {
    pub fn state_of(&self, host: &str) -> Option<MembershipState> {
        self.hosts.iter().find(|h| h.host == host).map(|h| h.state)
    }
}

struct SettingsPlan {
    default_sr: Option<OpaqueRef>,
    management_network: Option<(String, OpaqueRef)>,
}

/// Pool reconciler.
pub struct PoolReconciler {
    /// Waiting for joined hosts to come up live.
    pub convergence: RetryPolicy,
    /// Retrying each eject while the toolstack reorganizes.
    pub eject: RetryPolicy,
    /// Toolstack restart time after moving the management interface.
    pub settle: Duration,
}

impl Default for PoolReconciler {
    fn default() -> Self {
        Self {
            convergence: RetryPolicy::convergence(),
            eject: RetryPolicy::convergence(),
            settle: Duration::from_secs(60),
        }
    }
}

/// The coordinator's pool object.
pub(crate) async fn coordinator_pool(session: &Session) -> Result<(OpaqueRef, PoolRecord)> {
    let pools = session
        .get_all(ObjectKind::Pool)
        .await
        .remote("pool.get_all", session.base_url())?;
    let pool = pools.into_iter().next().ok_or_else(|| ProviderError::NotFound {
        what: "pool",
        detail: session.base_url().to_string(),
    })?;
    let record = session
        .get_record(ObjectKind::Pool, &pool)
        .await
        .remote("pool.get_record", &pool)?;
    Ok((pool, record))
}

/// The pool coordinator host.
pub(crate) async fn coordinator(session: &Session) -> Result<OpaqueRef> {
    Ok(coordinator_pool(session).await?.1.master)
}

/// UUID of the network behind the coordinator's management PIF.
async fn management_network_uuid(session: &Session, coordinator: &OpaqueRef) -> Result<String> {
    let pifs: Vec<OpaqueRef> = session
        .get_field(ObjectKind::Host, coordinator, "PIFs")
        .await
        .remote("host.get_PIFs", coordinator)?;
    for pif in &pifs {
        let record: PifRecord = session
            .get_record(ObjectKind::Pif, pif)
            .await
            .remote("PIF.get_record", pif)?;
        if record.management {
            return uuid_of(session, ObjectKind::Network, &record.network).await;
        }
    }
    Err(ProviderError::NotFound {
        what: "management network",
        detail: format!("no management PIF on coordinator {coordinator}"),
    })
}

impl PoolReconciler {
    /// UUID of the pool member reachable at `address`, as the coordinator
    /// records it. Empty when no member has that address.
    async fn member_uuid(&self, ctx: &ProviderContext, address: &str) -> Result<String> {
        let hosts: BTreeMap<OpaqueRef, HostRecord> = ctx
            .session
            .get_all_records(ObjectKind::Host)
            .await
            .remote("host.get_all_records", ctx.config.address())?;
        Ok(hosts
            .into_values()
            .find(|host| host_address(&host.address) == address)
            .map(|host| host.uuid)
            .unwrap_or_default())
    }

    /// Classify every join candidate and eject target without changing anything.
    pub async fn plan_membership(
        &self,
        ctx: &ProviderContext,
        config: &PoolConfig,
        pool: &PoolRecord,
    ) -> Result<MembershipPlan> {
        let coordinator = ctx.config.address();
        let mut plan = MembershipPlan::default();
        let mut seen_hosts = BTreeSet::new();
        let mut seen_uuids = BTreeSet::new();

        for supporter in &config.join_supporters {
            let address = host_address(&supporter.host).to_string();
            if address.is_empty() || !seen_hosts.insert(address.clone()) {
                continue;
            }

            let session = match ctx
                .connector
                .connect(&supporter.host, &supporter.username, &supporter.password)
                .await
            {
                Ok(session) => session,
                Err(e) if e.is_code(codes::HOST_IS_SLAVE) => {
                    let master = e
                        .remote()
                        .and_then(|r| r.params.first())
                        .map(String::as_str)
                        .unwrap_or_default();
                    if host_address(master) != coordinator {
                        return Err(ProviderError::NotStandaloneHost {
                            address,
                            reason: format!("it belongs to the pool coordinated by {master}"),
                        });
                    }
                    let uuid = self.member_uuid(ctx, &address).await?;
                    if config.eject_supporters.contains(&uuid) {
                        return Err(ProviderError::JoinEjectConflict { address, uuid });
                    }
                    debug!(host = %address, uuid = %uuid, "already a supporter of this pool");
                    seen_uuids.insert(uuid.clone());
                    plan.hosts.push(PlannedHost {
                        host: address,
                        uuid,
                        state: MembershipState::Member,
                    });
                    continue;
                }
                Err(e) => return Err(e).remote("session.login_with_password", &address),
            };

            let hosts = session
                .get_all(ObjectKind::Host)
                .await
                .remote("host.get_all", &address)?;
            let [own] = hosts.as_slice() else {
                return Err(ProviderError::NotStandaloneHost {
                    reason: format!("its pool has {} hosts", hosts.len()),
                    address,
                });
            };
            let uuid = session
                .get_uuid(ObjectKind::Host, own)
                .await
                .remote("host.get_uuid", &address)?;

            if config.eject_supporters.contains(&uuid) {
                return Err(ProviderError::JoinEjectConflict { address, uuid });
            }
            if !seen_uuids.insert(uuid.clone()) {
                continue;
            }
            if find_ref(&ctx.session, ObjectKind::Host, &uuid).await?.is_some() {
                plan.hosts.push(PlannedHost {
                    host: address,
                    uuid,
                    state: MembershipState::Member,
                });
                continue;
            }

            plan.hosts.push(PlannedHost {
                host: address.clone(),
                uuid: uuid.clone(),
                state: MembershipState::Standalone,
            });
            plan.joins.push(Candidate {
                uuid,
                address,
                session,
            });
        }

        for uuid in &config.eject_supporters {
            let state = match find_ref(&ctx.session, ObjectKind::Host, uuid).await? {
                Some(host) if host == pool.master => {
                    return Err(ProviderError::invalid(
                        "eject_supporters",
                        uuid,
                        "the coordinator can not be ejected",
                    ));
                }
                Some(_) => {
                    plan.ejects.push(uuid.clone());
                    MembershipState::PendingEject
                }
                None => MembershipState::NotMember,
            };
            plan.hosts.push(PlannedHost {
                host: uuid.clone(),
                uuid: uuid.clone(),
                state,
            });
        }

        Ok(plan)
    }

    async fn plan_settings(&self, ctx: &ProviderContext, config: &PoolConfig) -> Result<SettingsPlan> {
        let session = &ctx.session;
        let default_sr = match config.default_sr.as_deref().filter(|u| !u.is_empty()) {
            Some(uuid) => {
                let sr = ref_of(session, ObjectKind::Sr, uuid).await?;
                let shared: bool = session
                    .get_field(ObjectKind::Sr, &sr, "shared")
                    .await
                    .remote("SR.get_shared", uuid)?;
                if !shared {
                    return Err(ProviderError::NonSharedDefaultSr {
                        uuid: uuid.to_string(),
                    });
                }
                Some(sr)
            }
            None => None,
        };
        let management_network = match config.management_network.as_deref().filter(|u| !u.is_empty()) {
            Some(uuid) => Some((
                uuid.to_string(),
                ref_of(session, ObjectKind::Network, uuid).await?,
            )),
            None => None,
        };
        Ok(SettingsPlan {
            default_sr,
            management_network,
        })
    }

    /// Issue the planned joins; returns the UUIDs that were joined.
    async fn join(&self, ctx: &ProviderContext, plan: &mut MembershipPlan) -> Result<Vec<String>> {
        let mut joined = Vec::new();
        for candidate in &plan.joins {
            info!(host = %candidate.address, uuid = %candidate.uuid, "joining pool");
            candidate
                .session
                .invoke_unit(
                    "pool.join",
                    vec![
                        json!(ctx.config.address()),
                        json!(ctx.config.username),
                        json!(ctx.config.password),
                    ],
                )
                .await
                .remote("pool.join", format!("host {}", candidate.uuid))?;
            joined.push(candidate.uuid.clone());
        }
        for host in plan.hosts.iter_mut() {
            if joined.contains(&host.uuid) {
                host.state = MembershipState::PendingJoin;
            }
        }
        Ok(joined)
    }

    /// Block until every joined host reports live.
    pub async fn wait_live(&self, ctx: &ProviderContext, joined: &[String]) -> Result<()> {
        if joined.is_empty() {
            return Ok(());
        }
        info!(count = joined.len(), "waiting for supporters to become live");
        let session = &ctx.session;
        let what = "pool supporters to become live";
        retry(&self.convergence, &ctx.cancel, what, || async move {
            for uuid in joined {
                let host = ref_of(session, ObjectKind::Host, uuid).await?;
                let metrics: OpaqueRef = session
                    .get_field(ObjectKind::Host, &host, "metrics")
                    .await
                    .remote("host.get_metrics", uuid)?;
                let live: bool = session
                    .get_field(ObjectKind::HostMetrics, &metrics, "live")
                    .await
                    .remote("host_metrics.get_live", uuid)?;
                if !live {
                    return Err(ProviderError::NotLive { host: uuid.clone() });
                }
                debug!(host = %uuid, "supporter is live");
            }
            Ok(())
        })
        .await
        .map_err(|e| match e {
            ProviderError::Cancelled(_) => e,
            other => ProviderError::Timeout {
                wait: what.to_string(),
                after: self.convergence.max_elapsed,
                last_error: Some(other.to_string()),
            },
        })
    }

    /// Eject one host, retrying while the toolstack settles. A host that is
    /// already gone counts as ejected.
    async fn eject_host(&self, ctx: &ProviderContext, uuid: &str) -> Result<()> {
        let session = &ctx.session;
        retry(&self.eject, &ctx.cancel, &format!("eject of host {uuid}"), || async move {
            let Some(host) = find_ref(session, ObjectKind::Host, uuid).await? else {
                return Ok(());
            };
            match session.invoke_unit("pool.eject", vec![(&host).into()]).await {
                Err(e) if e.is_gone() => Ok(()),
                result => result.remote("pool.eject", format!("host {uuid}")),
            }
        })
        .await?;
        info!(host = %uuid, "ejected from pool");
        Ok(())
    }

    /// Wait out the toolstack restart that follows a management reconfigure.
    pub async fn settle(&self, ctx: &ProviderContext) -> Result<()> {
        info!(seconds = self.settle.as_secs(), "waiting for toolstack restart");
        pause(&ctx.cancel, self.settle, "toolstack restart after management reconfigure").await
    }

    async fn apply_settings(
        &self,
        ctx: &ProviderContext,
        pool_ref: &OpaqueRef,
        pool: &PoolRecord,
        config: &PoolConfig,
        settings: SettingsPlan,
    ) -> Result<()> {
        let session = &ctx.session;
        session
            .set_field(ObjectKind::Pool, pool_ref, "name_label", json!(config.name_label))
            .await
            .remote("pool.set_name_label", pool_ref)?;
        session
            .set_field(
                ObjectKind::Pool,
                pool_ref,
                "name_description",
                json!(config.name_description),
            )
            .await
            .remote("pool.set_name_description", pool_ref)?;
        if let Some(sr) = &settings.default_sr {
            session
                .set_field(ObjectKind::Pool, pool_ref, "default_SR", sr.into())
                .await
                .remote("pool.set_default_SR", pool_ref)?;
        }
        if let Some((uuid, network)) = &settings.management_network {
            let current = management_network_uuid(session, &pool.master).await?;
            if &current != uuid {
                info!(network = %uuid, "reconfiguring management network");
                session
                    .invoke_unit("pool.management_reconfigure", vec![network.into()])
                    .await
                    .remote("pool.management_reconfigure", format!("network {uuid}"))?;
                self.settle(ctx).await?;
            }
        }
        Ok(())
    }

    async fn apply(&self, ctx: &ProviderContext, config: &PoolConfig) -> Result<()> {
        let (pool_ref, pool) = coordinator_pool(&ctx.session).await?;
        let mut plan = self.plan_membership(ctx, config, &pool).await?;
        let settings = self.plan_settings(ctx, config).await?;

        let joined = self.join(ctx, &mut plan).await?;
        self.wait_live(ctx, &joined).await?;
        for uuid in &plan.ejects {
            self.eject_host(ctx, uuid).await?;
        }
        self.apply_settings(ctx, &pool_ref, &pool, config, settings)
            .await
    }

    async fn read_pool(
        &self,
        ctx: &ProviderContext,
        join_supporters: &[JoinSupporter],
        eject_supporters: &BTreeSet<String>,
    ) -> Result<PoolState> {
        let session = &ctx.session;
        let (_, pool) = coordinator_pool(session).await?;
        let default_sr = uuid_of(session, ObjectKind::Sr, &pool.default_sr)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "unable to resolve default SR");
                String::new()
            });
        let management_network = management_network_uuid(session, &pool.master).await?;
        let hosts = session
            .get_all(ObjectKind::Host)
            .await
            .remote("host.get_all", session.base_url())?;
        let others: Vec<OpaqueRef> = hosts.into_iter().filter(|h| *h != pool.master).collect();
        let supporters = uuids_of(session, ObjectKind::Host, &others).await?;
        Ok(PoolState {
            uuid: pool.uuid,
            name_label: pool.name_label,
            name_description: pool.name_description,
            default_sr,
            management_network,
            join_supporters: join_supporters.to_vec(),
            eject_supporters: eject_supporters.clone(),
            supporters,
        })
    }
}

#[async_trait]
impl Reconciler for PoolReconciler {
    type Config = PoolConfig;
    type State = PoolState;

    async fn create(&self, ctx: &ProviderContext, config: &PoolConfig) -> Result<PoolState> {
        self.apply(ctx, config).await?;
        self.read_pool(ctx, &config.join_supporters, &config.eject_supporters)
            .await
    }

    async fn read(&self, ctx: &ProviderContext, state: &PoolState) -> Result<PoolState> {
        self.read_pool(ctx, &state.join_supporters, &state.eject_supporters)
            .await
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        config: &PoolConfig,
        _state: &PoolState,
    ) -> Result<PoolState> {
        self.apply(ctx, config).await?;
        self.read_pool(ctx, &config.join_supporters, &config.eject_supporters)
            .await
    }

    /// Clear the name and eject every supporter.
    async fn delete(&self, ctx: &ProviderContext, _state: &PoolState) -> Result<()> {
        let session = &ctx.session;
        let (pool_ref, pool) = coordinator_pool(session).await?;
        session
            .set_field(ObjectKind::Pool, &pool_ref, "name_label", json!(""))
            .await
            .remote("pool.set_name_label", &pool_ref)?;
        let hosts = session
            .get_all(ObjectKind::Host)
            .await
            .remote("host.get_all", session.base_url())?;
        for host in hosts.iter().filter(|h| **h != pool.master) {
            let uuid = match session.get_uuid(ObjectKind::Host, host).await {
                Ok(uuid) => uuid,
                Err(e) if e.is_gone() => continue,
                Err(e) => return Err(e).remote("host.get_uuid", host),
            };
            self.eject_host(ctx, &uuid).await?;
        }
        Ok(())
    }
}
