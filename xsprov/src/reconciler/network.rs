//! Networks, plain or attached to a NIC through a VLAN tag.
//!
//! A VLAN network is addressed by a NIC name as shown to users:
//! `NIC <n>` for physical `eth<n>`, `NIC-SR-IOV <n>` for the SR-IOV logical
//! PIF on `eth<n>`, and `Bond <a>+<b>` for the bond of `eth<a>` and `eth<b>`.
//! `pool.create_VLAN_from_PIF` then creates the VLAN on every host.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{Reconciler, ensure_unchanged, ignore_gone};
use crate::config::ProviderContext;
use crate::error::{ProviderError, RemoteContext, Result};
use crate::resolve::{find_ref, ref_of};
use crate::xapi::records::{BondRecord, NetworkRecord, PifRecord, StringMap, VlanRecord};
use crate::xapi::{ObjectKind, OpaqueRef, Session};

fn default_mtu() -> i64 {
    1500
}

fn default_managed() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    #[serde(default = "default_mtu")]
    pub mtu: i64,
    /// Whether the toolstack manages the bridge.
    #[serde(default = "default_managed")]
    pub managed: bool,
    #[serde(default)]
    pub other_config: StringMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub mtu: i64,
    pub managed: bool,
    pub other_config: StringMap,
    pub bridge: String,
}

fn validate(config: &NetworkConfig) -> Result<()> {
    if config.name_label.is_empty() {
        return Err(ProviderError::invalid("name_label", "", "must not be empty"));
    }
    if config.mtu <= 0 {
        return Err(ProviderError::invalid("mtu", config.mtu, "must be above 0"));
    }
    Ok(())
}

async fn create_network(session: &Session, config: &NetworkConfig) -> Result<OpaqueRef> {
    let record = NetworkRecord {
        name_label: config.name_label.clone(),
        name_description: config.name_description.clone(),
        mtu: config.mtu,
        managed: config.managed,
        other_config: config.other_config.clone(),
        ..Default::default()
    };
    let network = session
        .create(ObjectKind::Network, &record)
        .await
        .remote("network.create", &config.name_label)?;
    info!(network = %network, name = %config.name_label, "created network");
    Ok(network)
}

async fn read_network(session: &Session, network: &OpaqueRef) -> Result<(NetworkRecord, NetworkState)> {
    let record: NetworkRecord = session
        .get_record(ObjectKind::Network, network)
        .await
        .remote("network.get_record", network)?;
    let state = NetworkState {
        uuid: record.uuid.clone(),
        name_label: record.name_label.clone(),
        name_description: record.name_description.clone(),
        mtu: record.mtu,
        managed: record.managed,
        other_config: record.other_config.clone(),
        bridge: record.bridge.clone(),
    };
    Ok((record, state))
}

/// Apply the mutable fields that differ from `record`.
async fn update_network(session: &Session, network: &OpaqueRef, record: &NetworkRecord, config: &NetworkConfig) -> Result<()> {
    let uuid = &record.uuid;
    if record.name_label != config.name_label {
        session
            .set_field(ObjectKind::Network, network, "name_label", json!(config.name_label))
            .await
            .remote("network.set_name_label", uuid)?;
    }
    if record.name_description != config.name_description {
        session
            .set_field(ObjectKind::Network, network, "name_description", json!(config.name_description))
            .await
            .remote("network.set_name_description", uuid)?;
    }
    if record.mtu != config.mtu {
        session
            .set_field(ObjectKind::Network, network, "MTU", json!(config.mtu))
            .await
            .remote("network.set_MTU", uuid)?;
    }
    if record.other_config != config.other_config {
        session
            .set_field(ObjectKind::Network, network, "other_config", json!(config.other_config))
            .await
            .remote("network.set_other_config", uuid)?;
    }
    Ok(())
}

/// Destroy the VLANs on the network's PIFs, then the network.
async fn destroy_network(session: &Session, network: &OpaqueRef) -> Result<()> {
    let pifs: Vec<OpaqueRef> = session
        .get_field(ObjectKind::Network, network, "PIFs")
        .await
        .remote("network.get_PIFs", network)?;
    for pif in &pifs {
        let vlan: OpaqueRef = ignore_gone(session.get_field(ObjectKind::Pif, pif, "VLAN_master_of").await)
            .remote("PIF.get_VLAN_master_of", pif)?;
        if vlan.is_null() {
            continue;
        }
        ignore_gone(session.destroy(ObjectKind::Vlan, &vlan).await).remote("VLAN.destroy", &vlan)?;
        debug!(vlan = %vlan, pif = %pif, "destroyed VLAN");
    }
    session
        .destroy(ObjectKind::Network, network)
        .await
        .remote("network.destroy", network)
}

async fn delete_by_uuid(session: &Session, uuid: &str) -> Result<()> {
    let Some(network) = find_ref(session, ObjectKind::Network, uuid).await? else {
        debug!(network = %uuid, "network already gone");
        return Ok(());
    };
    destroy_network(session, &network).await?;
    info!(network = %uuid, "destroyed network");
    Ok(())
}

/// Reconciles [`NetworkConfig`].
#[derive(Debug, Clone, Default)]
pub struct NetworkReconciler;

#[async_trait]
impl Reconciler for NetworkReconciler {
    type Config = NetworkConfig;
    type State = NetworkState;

    async fn create(&self, ctx: &ProviderContext, config: &NetworkConfig) -> Result<NetworkState> {
        validate(config)?;
        let network = create_network(&ctx.session, config).await?;
        Ok(read_network(&ctx.session, &network).await?.1)
    }

    async fn read(&self, ctx: &ProviderContext, state: &NetworkState) -> Result<NetworkState> {
        let network = ref_of(&ctx.session, ObjectKind::Network, &state.uuid).await?;
        Ok(read_network(&ctx.session, &network).await?.1)
    }

    async fn update(&self, ctx: &ProviderContext, config: &NetworkConfig, state: &NetworkState) -> Result<NetworkState> {
        validate(config)?;
        ensure_unchanged("network", "managed", &config.managed, &state.managed)?;
        let session = &ctx.session;
        let network = ref_of(session, ObjectKind::Network, &state.uuid).await?;
        let (record, _) = read_network(session, &network).await?;
        update_network(session, &network, &record, config).await?;
        Ok(read_network(session, &network).await?.1)
    }

    async fn delete(&self, ctx: &ProviderContext, state: &NetworkState) -> Result<()> {
        delete_by_uuid(&ctx.session, &state.uuid).await
    }
}

/// A NIC as named to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nic {
    Physical(u32),
    SrIov(u32),
    /// Sorted slave device numbers.
    Bond(Vec<u32>),
}

impl FromStr for Nic {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProviderError::invalid("nic", s, "expected \"NIC <n>\", \"NIC-SR-IOV <n>\" or \"Bond <a>+<b>\"");
        let (kind, rest) = s.trim().split_once(' ').ok_or_else(invalid)?;
        let number = |n: &str| n.trim().parse::<u32>().map_err(|_| invalid());
        match kind {
            "NIC" => Ok(Nic::Physical(number(rest)?)),
            "NIC-SR-IOV" => Ok(Nic::SrIov(number(rest)?)),
            "Bond" => {
                let mut slaves = rest.split('+').map(number).collect::<Result<Vec<_>>>()?;
                if slaves.len() < 2 {
                    return Err(invalid());
                }
                slaves.sort_unstable();
                Ok(Nic::Bond(slaves))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Nic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nic::Physical(n) => write!(f, "NIC {n}"),
            Nic::SrIov(n) => write!(f, "NIC-SR-IOV {n}"),
            Nic::Bond(slaves) => {
                let joined: Vec<String> = slaves.iter().map(u32::to_string).collect();
                write!(f, "Bond {}", joined.join("+"))
            }
        }
    }
}

fn eth_number(device: &str) -> Option<u32> {
    device.strip_prefix("eth")?.parse().ok()
}

async fn bond_slave_numbers(session: &Session, bond: &BondRecord) -> Result<Vec<u32>> {
    let mut numbers = Vec::with_capacity(bond.slaves.len());
    for slave in &bond.slaves {
        let device: String = session
            .get_field(ObjectKind::Pif, slave, "device")
            .await
            .remote("PIF.get_device", slave)?;
        numbers.extend(eth_number(&device));
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// The PIF a VLAN for `nic` is created on.
pub async fn resolve_nic(session: &Session, nic: &Nic) -> Result<OpaqueRef> {
    let pifs = session
        .get_all_records::<PifRecord>(ObjectKind::Pif)
        .await
        .remote("PIF.get_all_records", "pool")?;
    let device = match nic {
        Nic::Physical(n) | Nic::SrIov(n) => format!("eth{n}"),
        Nic::Bond(slaves) => {
            let bonds = session
                .get_all_records::<BondRecord>(ObjectKind::Bond)
                .await
                .remote("Bond.get_all_records", "pool")?;
            let mut master = None;
            for bond in bonds.values() {
                if bond_slave_numbers(session, bond).await? == *slaves {
                    master = pifs.get(&bond.master).map(|pif| pif.device.clone());
                    break;
                }
            }
            master.ok_or_else(|| ProviderError::NotFound {
                what: "bond",
                detail: nic.to_string(),
            })?
        }
    };
    pifs.iter()
        .find(|(_, pif)| {
            pif.device == device
                && match nic {
                    Nic::Physical(_) => pif.physical && pif.bond_slave_of.is_null(),
                    Nic::SrIov(_) => !pif.physical && !pif.sriov_logical_pif_of.is_empty(),
                    Nic::Bond(_) => !pif.physical && !pif.bond_master_of.is_empty(),
                }
        })
        .map(|(reference, _)| reference.clone())
        .ok_or_else(|| ProviderError::NotFound {
            what: "PIF",
            detail: format!("no PIF for {nic}"),
        })
}

/// What a listed NIC is going to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicUse {
    /// Bonds, unbonded physical NICs and SR-IOV NICs.
    Vlan,
    /// Physical NICs not yet in a bond.
    Bond,
    /// SR-IOV capable NICs without an SR-IOV network.
    Sriov,
}

/// Names of the NICs in the pool, sorted and without repeats. Without a
/// `purpose` every bond, physical and SR-IOV NIC is listed.
pub async fn available_nics(session: &Session, purpose: Option<NicUse>) -> Result<Vec<String>> {
    let pifs = session
        .get_all_records::<PifRecord>(ObjectKind::Pif)
        .await
        .remote("PIF.get_all_records", "pool")?;
    let physical = |pif: &&PifRecord| pif.physical;
    let unbonded = |pif: &&PifRecord| pif.physical && pif.bond_slave_of.is_null();
    let sriov = |pif: &&PifRecord| unbonded(pif) && !pif.sriov_physical_pif_of.is_empty();
    let named = |filter: &dyn Fn(&&PifRecord) -> bool, make: fn(u32) -> Nic| -> Vec<Nic> {
        pifs.values()
            .filter(|pif| filter(pif))
            .filter_map(|pif| eth_number(&pif.device).map(make))
            .collect()
    };

    let nics: Vec<Nic> = match purpose {
        None => {
            let mut nics = bond_nics(session, &pifs).await?;
            nics.extend(named(&physical, Nic::Physical));
            nics.extend(named(&sriov, Nic::SrIov));
            nics
        }
        Some(NicUse::Vlan) => {
            let mut nics = bond_nics(session, &pifs).await?;
            nics.extend(named(&unbonded, Nic::Physical));
            nics.extend(named(&sriov, Nic::SrIov));
            nics
        }
        Some(NicUse::Bond) => named(&unbonded, Nic::Physical),
        Some(NicUse::Sriov) => named(
            &|pif: &&PifRecord| {
                pif.physical
                    && pif.capabilities.iter().any(|c| c == "sriov")
                    && pif.sriov_physical_pif_of.is_empty()
            },
            Nic::Physical,
        ),
    };
    let names: BTreeSet<String> = nics.iter().map(Nic::to_string).collect();
    Ok(names.into_iter().collect())
}

async fn bond_nics(
    session: &Session,
    pifs: &std::collections::BTreeMap<OpaqueRef, PifRecord>,
) -> Result<Vec<Nic>> {
    let bonds = session
        .get_all_records::<BondRecord>(ObjectKind::Bond)
        .await
        .remote("Bond.get_all_records", "pool")?;
    let mut masters = BTreeSet::new();
    let mut nics = Vec::new();
    for bond in bonds.values() {
        let Some(master) = pifs.get(&bond.master) else {
            continue;
        };
        if masters.insert(master.device.clone()) {
            nics.push(Nic::Bond(bond_slave_numbers(session, bond).await?));
        }
    }
    Ok(nics)
}

/// Name the NIC a VLAN PIF hangs off.
async fn nic_of(session: &Session, pif: &PifRecord) -> Result<Option<Nic>> {
    if pif.vlan_master_of.is_null() {
        return Ok(eth_number(&pif.device).map(Nic::Physical));
    }
    let vlan: VlanRecord = session
        .get_record(ObjectKind::Vlan, &pif.vlan_master_of)
        .await
        .remote("VLAN.get_record", &pif.vlan_master_of)?;
    let tagged: PifRecord = session
        .get_record(ObjectKind::Pif, &vlan.tagged_pif)
        .await
        .remote("PIF.get_record", &vlan.tagged_pif)?;
    if let Some(bond) = tagged.bond_master_of.first() {
        let bond: BondRecord = session
            .get_record(ObjectKind::Bond, bond)
            .await
            .remote("Bond.get_record", bond)?;
        return Ok(Some(Nic::Bond(bond_slave_numbers(session, &bond).await?)));
    }
    Ok(eth_number(&tagged.device).map(|n| {
        if tagged.sriov_logical_pif_of.is_empty() {
            Nic::Physical(n)
        } else {
            Nic::SrIov(n)
        }
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanConfig {
    #[serde(flatten)]
    pub network: NetworkConfig,
    pub vlan_tag: i64,
    pub nic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanState {
    #[serde(flatten)]
    pub network: NetworkState,
    pub vlan_tag: i64,
    pub nic: String,
}

fn validate_vlan(config: &VlanConfig) -> Result<Nic> {
    validate(&config.network)?;
    if !(0..=4094).contains(&config.vlan_tag) {
        return Err(ProviderError::invalid("vlan_tag", config.vlan_tag, "must be within 0..=4094"));
    }
    config.nic.parse()
}

/// Reconciles [`VlanConfig`].
#[derive(Debug, Clone, Default)]
pub struct VlanReconciler;

impl VlanReconciler {
    async fn read_vlan(&self, session: &Session, network: &OpaqueRef) -> Result<VlanState> {
        let (record, state) = read_network(session, network).await?;
        let Some(pif) = record.pifs.first() else {
            return Err(ProviderError::NotFound {
                what: "PIF",
                detail: format!("network {} has no VLAN PIF", record.uuid),
            });
        };
        let pif: PifRecord = session
            .get_record(ObjectKind::Pif, pif)
            .await
            .remote("PIF.get_record", pif)?;
        let nic = nic_of(session, &pif).await?;
        Ok(VlanState {
            network: state,
            vlan_tag: pif.vlan,
            nic: nic.map(|n| n.to_string()).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Reconciler for VlanReconciler {
    type Config = VlanConfig;
    type State = VlanState;

    async fn create(&self, ctx: &ProviderContext, config: &VlanConfig) -> Result<VlanState> {
        let nic = validate_vlan(config)?;
        let session = &ctx.session;
        let network = create_network(session, &config.network).await?;

        let attached: Result<VlanState> = async {
            let pif = resolve_nic(session, &nic).await?;
            let _: Vec<OpaqueRef> = session
                .invoke(
                    "pool.create_VLAN_from_PIF",
                    vec![(&pif).into(), (&network).into(), json!(config.vlan_tag)],
                )
                .await
                .remote("pool.create_VLAN_from_PIF", &nic)?;
            info!(network = %network, nic = %nic, tag = config.vlan_tag, "created VLAN");
            self.read_vlan(session, &network).await
        }
        .await;

        match attached {
            Ok(state) => Ok(state),
            Err(e) => match destroy_network(session, &network).await {
                Ok(()) => Err(e),
                Err(cleanup) => Err(ProviderError::cleanup_failed(e, cleanup)),
            },
        }
    }

    async fn read(&self, ctx: &ProviderContext, state: &VlanState) -> Result<VlanState> {
        let network = ref_of(&ctx.session, ObjectKind::Network, &state.network.uuid).await?;
        self.read_vlan(&ctx.session, &network).await
    }

    async fn update(&self, ctx: &ProviderContext, config: &VlanConfig, state: &VlanState) -> Result<VlanState> {
        let nic = validate_vlan(config)?;
        ensure_unchanged("VLAN network", "nic", &nic.to_string(), &state.nic)?;
        ensure_unchanged("VLAN network", "vlan_tag", &config.vlan_tag, &state.vlan_tag)?;
        ensure_unchanged("VLAN network", "managed", &config.network.managed, &state.network.managed)?;

        let session = &ctx.session;
        let network = ref_of(session, ObjectKind::Network, &state.network.uuid).await?;
        let (record, _) = read_network(session, &network).await?;
        update_network(session, &network, &record, &config.network).await?;
        self.read_vlan(session, &network).await
    }

    async fn delete(&self, ctx: &ProviderContext, state: &VlanState) -> Result<()> {
        delete_by_uuid(&ctx.session, &state.network.uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeXapi;

    /// `eth0` (management), `eth1`, a bond of `eth2`+`eth3` and an SR-IOV
    /// logical PIF on `eth4`.
    fn fixture() -> FakeXapi {
        let fake = FakeXapi::standalone("10.0.0.1", "host-a");
        let host = fake.find_by_uuid(ObjectKind::Host, "host-a").unwrap();
        fake.insert(ObjectKind::Pif, json!({"device": "eth1", "host": host, "physical": true}));

        let bond = fake.insert(ObjectKind::Bond, json!({}));
        let eth2 = fake.insert(
            ObjectKind::Pif,
            json!({"device": "eth2", "host": host, "physical": true, "bond_slave_of": bond}),
        );
        let eth3 = fake.insert(
            ObjectKind::Pif,
            json!({"device": "eth3", "host": host, "physical": true, "bond_slave_of": bond}),
        );
        let master = fake.insert(
            ObjectKind::Pif,
            json!({"device": "bond0", "host": host, "bond_master_of": [bond]}),
        );
        fake.set(ObjectKind::Bond, &bond, "master", json!(master));
        fake.set(ObjectKind::Bond, &bond, "slaves", json!([eth3, eth2]));

        fake.insert(ObjectKind::Pif, json!({"device": "eth4", "host": host, "physical": true}));
        fake.insert(
            ObjectKind::Pif,
            json!({"device": "eth4", "host": host, "sriov_logical_PIF_of": ["OpaqueRef:sriov-1"]}),
        );
        fake
    }

    fn network() -> NetworkConfig {
        NetworkConfig {
            name_label: "storage".into(),
            name_description: String::new(),
            mtu: 1500,
            managed: true,
            other_config: StringMap::new(),
        }
    }

    fn vlan(nic: &str, tag: i64) -> VlanConfig {
        VlanConfig {
            network: network(),
            vlan_tag: tag,
            nic: nic.into(),
        }
    }

    #[test]
    fn nic_names_parse_and_print() {
        assert_eq!("NIC 1".parse::<Nic>().unwrap(), Nic::Physical(1));
        assert_eq!("NIC-SR-IOV 4".parse::<Nic>().unwrap(), Nic::SrIov(4));
        let bond: Nic = "Bond 3+2".parse().unwrap();
        assert_eq!(bond, Nic::Bond(vec![2, 3]));
        assert_eq!(bond.to_string(), "Bond 2+3");
        for bad in ["eth1", "NIC", "NIC x", "Bond 2", "Team 1+2"] {
            let err = bad.parse::<Nic>().unwrap_err();
            assert_eq!(err.attribute(), Some("nic"), "{bad}");
        }
    }

    #[tokio::test]
    async fn network_updates_only_what_changed() {
        let fake = fixture();
        let ctx = fake.context();
        let state = NetworkReconciler.create(&ctx, &network()).await.unwrap();
        assert_eq!(state.mtu, 1500);
        assert!(state.managed);
        fake.clear_calls();

        let err = NetworkReconciler
            .update(&ctx, &NetworkConfig { managed: false, ..network() }, &state)
            .await
            .unwrap_err();
        assert_eq!(err.attribute(), Some("managed"));
        let err = NetworkReconciler
            .update(&ctx, &NetworkConfig { mtu: 0, ..network() }, &state)
            .await
            .unwrap_err();
        assert_eq!(err.attribute(), Some("mtu"));
        assert!(fake.mutations().is_empty());

        let state = NetworkReconciler
            .update(&ctx, &NetworkConfig { mtu: 9000, ..network() }, &state)
            .await
            .unwrap();
        assert_eq!(state.mtu, 9000);
        assert_eq!(fake.mutations(), vec!["network.set_MTU"]);

        NetworkReconciler.delete(&ctx, &state).await.unwrap();
        assert!(fake.find_by_uuid(ObjectKind::Network, &state.uuid).is_none());
    }

    #[tokio::test]
    async fn vlan_on_each_kind_of_nic_reads_back_its_name() {
        let fake = fixture();
        let ctx = fake.context();
        for (nic, tag) in [("NIC 1", 10), ("Bond 2+3", 20), ("NIC-SR-IOV 4", 30)] {
            let state = VlanReconciler.create(&ctx, &vlan(nic, tag)).await.unwrap();
            assert_eq!(state.nic, nic);
            assert_eq!(state.vlan_tag, tag);
        }
        assert_eq!(fake.count(ObjectKind::Vlan), 3);
    }

    #[tokio::test]
    async fn unknown_nic_destroys_the_new_network() {
        let fake = fixture();
        let ctx = fake.context();
        let networks = fake.count(ObjectKind::Network);
        let err = VlanReconciler.create(&ctx, &vlan("NIC 7", 10)).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { what: "PIF", .. }));
        assert_eq!(fake.count(ObjectKind::Network), networks);
        assert_eq!(fake.calls_to("network.destroy").len(), 1);
    }

    #[tokio::test]
    async fn vlan_identity_is_immutable_and_delete_removes_the_vlan() {
        let fake = fixture();
        let ctx = fake.context();
        let state = VlanReconciler.create(&ctx, &vlan("NIC 1", 10)).await.unwrap();
        fake.clear_calls();

        for (changed, field) in [(vlan("NIC 4", 10), "nic"), (vlan("NIC 1", 11), "vlan_tag")] {
            let err = VlanReconciler.update(&ctx, &changed, &state).await.unwrap_err();
            assert_eq!(err.attribute(), Some(field));
        }
        assert!(fake.mutations().is_empty());

        let renamed = VlanConfig {
            network: NetworkConfig {
                name_label: "storage-10".into(),
                ..network()
            },
            ..vlan("NIC 1", 10)
        };
        let state = VlanReconciler.update(&ctx, &renamed, &state).await.unwrap();
        assert_eq!(state.network.name_label, "storage-10");

        fake.clear_calls();
        VlanReconciler.delete(&ctx, &state).await.unwrap();
        assert_eq!(fake.mutations(), vec!["VLAN.destroy", "network.destroy"]);
        assert_eq!(fake.count(ObjectKind::Vlan), 0);
    }

    #[tokio::test]
    async fn nics_are_listed_by_what_they_will_carry() {
        let fake = fixture();
        fake.insert(
            ObjectKind::Pif,
            json!({"device": "eth5", "physical": true, "capabilities": ["sriov"],
                   "sriov_physical_PIF_of": ["OpaqueRef:sriov-5"]}),
        );
        fake.insert(
            ObjectKind::Pif,
            json!({"device": "eth6", "physical": true, "capabilities": ["sriov"]}),
        );
        let session = fake.session();

        let bond = available_nics(&session, Some(NicUse::Bond)).await.unwrap();
        assert_eq!(bond, ["NIC 0", "NIC 1", "NIC 4", "NIC 5", "NIC 6"]);

        let sriov = available_nics(&session, Some(NicUse::Sriov)).await.unwrap();
        assert_eq!(sriov, ["NIC 6"]);

        let vlan = available_nics(&session, Some(NicUse::Vlan)).await.unwrap();
        assert_eq!(
            vlan,
            ["Bond 2+3", "NIC 0", "NIC 1", "NIC 4", "NIC 5", "NIC 6", "NIC-SR-IOV 5"]
        );

        let all = available_nics(&session, None).await.unwrap();
        assert_eq!(all.len(), 9);
        assert!(all.contains(&"NIC 2".to_string()));
        assert!(fake.mutations().is_empty());
    }
}
