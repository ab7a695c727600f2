//! In-memory XenAPI host for tests.
//!
//! [`FakeXapi`] keeps object records as JSON maps keyed by class and
//! reference, answers the generic per-class messages for any class, and
//! models the lifecycle messages the reconcilers use closely enough to
//! observe their effects (clones copy disks, reverts mint new disk
//! identities, VLAN creation wires PIFs to networks, ...). Every call is
//! logged so tests can assert on exactly what reached the toolstack.
//!
//! [`FakeCluster`] routes logins by address to several fakes and carries
//! pool joins and ejects between them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, ProviderContext};
use crate::error::Result as ProviderResult;
use crate::xapi::{
    Connector, NULL_REF, ObjectKind, OpaqueRef, RemoteError, Session, Transport, XapiError, codes,
    host_address, host_url,
};

type Record = Map<String, Value>;

/// One call as it reached the fake.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub params: Vec<Value>,
}

impl Call {
    /// Argument `index`, not counting the session reference.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.params.get(index + 1)
    }

    /// False for reads (`get_*`, `assert_*`) and logins.
    pub fn is_mutation(&self) -> bool {
        let message = self.method.rsplit('.').next().unwrap_or_default();
        !(message.starts_with("get_")
            || message.starts_with("assert_")
            || message == "login_with_password")
    }
}

struct Failure {
    method: String,
    error: RemoteError,
    remaining: Option<u32>,
}

struct FakeState {
    base_url: String,
    objects: BTreeMap<String, BTreeMap<String, Record>>,
    calls: Vec<Call>,
    failures: Vec<Failure>,
    task_statuses: VecDeque<String>,
    next_id: u64,
    member_of: Option<String>,
    own_host_uuid: Option<String>,
    guest_networks: BTreeMap<String, String>,
    dhcp_ip: Option<String>,
    join_live: bool,
}

/// Shared handle to one fake host.
#[derive(Clone)]
pub struct FakeXapi {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeXapi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeXapi {
    /// An empty host with no objects at all.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                base_url: "https://fake.invalid".to_string(),
                objects: BTreeMap::new(),
                calls: Vec::new(),
                failures: Vec::new(),
                task_statuses: VecDeque::new(),
                next_id: 1,
                member_of: None,
                own_host_uuid: None,
                guest_networks: BTreeMap::new(),
                dhcp_ip: None,
                join_live: true,
            })),
        }
    }

    /// A standalone host at `address`: a single-host pool whose master has a
    /// live metrics object and one physical management PIF on `eth0`.
    pub fn standalone(address: &str, host_uuid: &str) -> Self {
        let fake = Self::new();
        fake.set_base_url(&host_url(address));
        let network = fake.insert(
            ObjectKind::Network,
            json!({"uuid": format!("{host_uuid}-net0"), "name_label": "Network 0", "bridge": "xenbr0"}),
        );
        let metrics = fake.insert(ObjectKind::HostMetrics, json!({"live": true}));
        let host = fake.insert(
            ObjectKind::Host,
            json!({"uuid": host_uuid, "name_label": address, "address": address, "metrics": metrics}),
        );
        let pif_metrics = fake.insert(ObjectKind::PifMetrics, json!({"carrier": true}));
        fake.insert(
            ObjectKind::Pif,
            json!({
                "device": "eth0", "network": network, "host": host, "physical": true,
                "management": true, "metrics": pif_metrics,
            }),
        );
        fake.insert(ObjectKind::Pool, json!({"master": host}));
        fake.lock().own_host_uuid = Some(host_uuid.to_string());
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A session on this host, without going through login.
    pub fn session(&self) -> Session {
        let base_url = self.lock().base_url.clone();
        Session::new(
            Arc::new(self.clone()),
            OpaqueRef::new("OpaqueRef:fake-session"),
            base_url,
        )
    }

    /// Operation context on this host with no other hosts reachable.
    pub fn context(&self) -> ProviderContext {
        let session = self.session();
        ProviderContext {
            config: ProviderConfig::new(session.base_url(), "root", "secret"),
            session,
            connector: Arc::new(FakeCluster::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn set_base_url(&self, base_url: &str) {
        self.lock().base_url = base_url.to_string();
    }

    /// Add an object; fields not given take toolstack defaults and a UUID is
    /// generated unless one is supplied.
    pub fn insert(&self, kind: ObjectKind, record: Value) -> OpaqueRef {
        let record = match record {
            Value::Object(map) => map,
            _ => Record::new(),
        };
        OpaqueRef::new(self.lock().insert(kind.class(), record))
    }

    /// Current record of an object, if it exists.
    pub fn record(&self, kind: ObjectKind, reference: &OpaqueRef) -> Option<Value> {
        self.lock()
            .objects
            .get(kind.class())
            .and_then(|class| class.get(reference.as_str()))
            .map(|r| Value::Object(r.clone()))
    }

    /// Overwrite one field of an existing object.
    pub fn set(&self, kind: ObjectKind, reference: &OpaqueRef, field: &str, value: Value) {
        if let Some(record) = self.lock().record_mut(kind.class(), reference.as_str()) {
            record.insert(field.to_string(), value);
        }
    }

    /// All objects of a class, ordered by reference.
    pub fn all(&self, kind: ObjectKind) -> Vec<(OpaqueRef, Value)> {
        self.lock()
            .objects
            .get(kind.class())
            .map(|class| {
                class
                    .iter()
                    .map(|(r, rec)| (OpaqueRef::new(r.clone()), Value::Object(rec.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.lock().objects.get(kind.class()).map_or(0, BTreeMap::len)
    }

    pub fn find_by_uuid(&self, kind: ObjectKind, uuid: &str) -> Option<OpaqueRef> {
        self.lock().by_uuid(kind.class(), uuid).map(OpaqueRef::new)
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls to one method.
    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Methods of all state-changing calls, in order.
    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .map(|c| c.method.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make every call to `method` fail with `code`.
    pub fn fail(&self, method: &str, code: &str, params: &[&str]) {
        self.push_failure(method, code, params, None);
    }

    /// Make the next `times` calls to `method` fail with `code`.
    pub fn fail_times(&self, method: &str, times: u32, code: &str, params: &[&str]) {
        self.push_failure(method, code, params, Some(times));
    }

    fn push_failure(&self, method: &str, code: &str, params: &[&str], remaining: Option<u32>) {
        self.lock().failures.push(Failure {
            method: method.to_string(),
            error: RemoteError::new(code, params.iter().map(|p| p.to_string()).collect()),
            remaining,
        });
    }

    /// Statuses returned by successive `task.get_status` calls; once the
    /// queue is drained tasks report `success`.
    pub fn script_task_statuses(&self, statuses: &[&str]) {
        self.lock()
            .task_statuses
            .extend(statuses.iter().map(|s| s.to_string()));
    }

    /// Address the guest agent reports once a VM starts.
    pub fn set_guest_ip(&self, ip: &str) {
        self.set_guest_networks(&[("0/ip", ip), ("0/ipv4/0", ip)]);
    }

    pub fn set_guest_networks(&self, networks: &[(&str, &str)]) {
        self.lock().guest_networks = networks
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    /// Address handed out when a PIF is reconfigured for DHCP.
    pub fn set_dhcp_ip(&self, ip: &str) {
        self.lock().dhcp_ip = Some(ip.to_string());
    }

    /// Whether hosts joining this coordinator come up live.
    pub fn set_join_live(&self, live: bool) {
        self.lock().join_live = live;
    }

    /// Mark this host as a supporter of the pool coordinated by `master`.
    pub fn set_member_of(&self, master: Option<&str>) {
        self.lock().member_of = master.map(str::to_string);
    }

    pub fn member_of(&self) -> Option<String> {
        self.lock().member_of.clone()
    }

    fn own_host_uuid(&self) -> Option<String> {
        self.lock().own_host_uuid.clone()
    }

    fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, XapiError> {
        let mut state = self.lock();
        state.calls.push(Call {
            method: method.to_string(),
            params: params.clone(),
        });
        if let Some(error) = state.take_failure(method) {
            return Err(error.into());
        }
        if method == "session.login_with_password" {
            if let Some(master) = &state.member_of {
                return Err(remote(codes::HOST_IS_SLAVE, &[master.as_str()]));
            }
            let id = state.next_id();
            return Ok(json!(format!("OpaqueRef:session-{id}")));
        }
        let Some((class, message)) = method.split_once('.') else {
            return Err(remote(codes::MESSAGE_METHOD_UNKNOWN, &[method]));
        };
        let args = params.get(1..).unwrap_or_default();
        state.handle(class, message, args)
    }
}

#[async_trait]
impl Transport for FakeXapi {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, XapiError> {
        self.dispatch(method, params)
    }
}

fn remote(code: &str, params: &[&str]) -> XapiError {
    RemoteError::new(code, params.iter().map(|p| p.to_string()).collect()).into()
}

fn handle_invalid(class: &str, reference: &str) -> XapiError {
    remote(codes::HANDLE_INVALID, &[class, reference])
}

fn arg_str<'a>(args: &'a [Value], index: usize) -> &'a str {
    args.get(index).and_then(Value::as_str).unwrap_or_default()
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

fn str_field<'a>(record: &'a Record, field: &str) -> &'a str {
    record.get(field).and_then(Value::as_str).unwrap_or_default()
}

fn ref_list(record: &Record, field: &str) -> Vec<String> {
    record
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn defaults(class: &str) -> Value {
    match class {
        "VM" => json!({
            "name_label": "", "name_description": "", "power_state": "Halted",
            "is_a_template": false, "is_a_snapshot": false, "snapshot_of": NULL_REF,
            "snapshots": [], "memory_static_min": 0, "memory_static_max": 0,
            "memory_dynamic_min": 0, "memory_dynamic_max": 0, "VCPUs_max": 1,
            "VCPUs_at_startup": 1, "platform": {}, "HVM_boot_params": {}, "other_config": {},
            "VBDs": [], "VIFs": [], "guest_metrics": NULL_REF, "resident_on": NULL_REF,
            "suspend_SR": NULL_REF, "snapshot_info": {},
        }),
        "VBD" => json!({
            "VM": NULL_REF, "VDI": NULL_REF, "type": "Disk", "mode": "RW", "bootable": false,
            "empty": false, "userdevice": "", "device": "", "unpluggable": true,
            "currently_attached": false, "other_config": {},
        }),
        "VDI" => json!({
            "name_label": "", "name_description": "", "SR": NULL_REF, "virtual_size": 0,
            "type": "user", "sharable": false, "read_only": false, "other_config": {},
            "sm_config": {}, "xenstore_data": {}, "tags": [], "VBDs": [],
        }),
        "VIF" => json!({
            "device": "0", "network": NULL_REF, "VM": NULL_REF, "MAC": "", "MTU": 1500,
            "other_config": {}, "locking_mode": "network_default", "currently_attached": false,
        }),
        "host" => json!({
            "name_label": "", "address": "", "enabled": true, "metrics": NULL_REF, "PIFs": [],
        }),
        "host_metrics" => json!({"live": true}),
        "pool" => json!({
            "name_label": "", "name_description": "", "master": NULL_REF, "default_SR": NULL_REF,
        }),
        "SR" => json!({
            "name_label": "", "name_description": "", "type": "", "content_type": "",
            "shared": false, "sm_config": {}, "other_config": {}, "PBDs": [], "VDIs": [],
            "physical_size": 0,
        }),
        "PBD" => json!({
            "host": NULL_REF, "SR": NULL_REF, "device_config": {}, "currently_attached": false,
        }),
        "network" => json!({
            "name_label": "", "name_description": "", "MTU": 1500, "managed": true,
            "other_config": {}, "bridge": "", "tags": [], "PIFs": [], "VIFs": [],
        }),
        "PIF" => json!({
            "device": "", "network": NULL_REF, "host": NULL_REF, "MAC": "", "MTU": 1500,
            "physical": false, "management": false, "capabilities": [], "VLAN": -1,
            "VLAN_master_of": NULL_REF, "bond_slave_of": NULL_REF, "bond_master_of": [],
            "sriov_logical_PIF_of": [], "sriov_physical_PIF_of": [],
            "IP": "", "ip_configuration_mode": "None", "metrics": NULL_REF,
            "disallow_unplug": false, "other_config": {},
        }),
        "PIF_metrics" => json!({"carrier": true}),
        "Bond" => json!({"master": NULL_REF, "slaves": []}),
        "VLAN" => json!({"tagged_PIF": NULL_REF, "untagged_PIF": NULL_REF, "tag": 0}),
        "VM_guest_metrics" => json!({"networks": {}}),
        "secret" => json!({"value": "", "other_config": {}}),
        "task" => json!({
            "name_label": "", "name_description": "", "status": "pending", "progress": 0.0,
            "error_info": [],
        }),
        _ => json!({}),
    }
}

/// Fields holding back-references maintained when objects come and go:
/// (class, field pointing at the owner, owner class, owner's list field).
const BACK_LINKS: &[(&str, &str, &str, &str)] = &[
    ("VBD", "VM", "VM", "VBDs"),
    ("VBD", "VDI", "VDI", "VBDs"),
    ("VIF", "VM", "VM", "VIFs"),
    ("VIF", "network", "network", "VIFs"),
    ("PBD", "SR", "SR", "PBDs"),
    ("PIF", "network", "network", "PIFs"),
    ("PIF", "host", "host", "PIFs"),
    ("VDI", "SR", "SR", "VDIs"),
];

impl FakeState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_failure(&mut self, method: &str) -> Option<RemoteError> {
        let failure = self
            .failures
            .iter_mut()
            .find(|f| f.method == method && f.remaining != Some(0))?;
        if let Some(n) = failure.remaining.as_mut() {
            *n -= 1;
        }
        Some(failure.error.clone())
    }

    fn insert(&mut self, class: &str, fields: Record) -> String {
        let mut record = match defaults(class) {
            Value::Object(map) => map,
            _ => Record::new(),
        };
        record.extend(fields);
        if str_field(&record, "uuid").is_empty() {
            record.insert("uuid".into(), json!(Uuid::new_v4().to_string()));
        }
        let reference = format!("OpaqueRef:{}-{}", class.to_lowercase(), self.next_id());
        for (owned, field, owner, list) in BACK_LINKS {
            if *owned == class {
                let target = str_field(&record, field).to_string();
                self.push_ref(owner, &target, list, &reference);
            }
        }
        self.objects
            .entry(class.to_string())
            .or_default()
            .insert(reference.clone(), record);
        reference
    }

    fn remove(&mut self, class: &str, reference: &str) -> Result<Record, XapiError> {
        let record = self
            .objects
            .get_mut(class)
            .and_then(|objects| objects.remove(reference))
            .ok_or_else(|| handle_invalid(class, reference))?;
        for (owned, field, owner, list) in BACK_LINKS {
            if *owned == class {
                let target = str_field(&record, field).to_string();
                self.pull_ref(owner, &target, list, reference);
            }
        }
        Ok(record)
    }

    fn record(&self, class: &str, reference: &str) -> Result<&Record, XapiError> {
        self.objects
            .get(class)
            .and_then(|objects| objects.get(reference))
            .ok_or_else(|| handle_invalid(class, reference))
    }

    fn record_mut(&mut self, class: &str, reference: &str) -> Option<&mut Record> {
        self.objects
            .get_mut(class)
            .and_then(|objects| objects.get_mut(reference))
    }

    fn set(&mut self, class: &str, reference: &str, field: &str, value: Value) -> Result<(), XapiError> {
        let record = self
            .record_mut(class, reference)
            .ok_or_else(|| handle_invalid(class, reference))?;
        record.insert(field.to_string(), value);
        Ok(())
    }

    fn by_uuid(&self, class: &str, uuid: &str) -> Option<String> {
        self.objects.get(class).and_then(|objects| {
            objects
                .iter()
                .find(|(_, r)| str_field(r, "uuid") == uuid)
                .map(|(reference, _)| reference.clone())
        })
    }

    fn push_ref(&mut self, class: &str, owner: &str, field: &str, reference: &str) {
        if let Some(record) = self.record_mut(class, owner) {
            let list = record.entry(field.to_string()).or_insert_with(|| json!([]));
            if let Some(items) = list.as_array_mut() {
                items.push(json!(reference));
            }
        }
    }

    fn pull_ref(&mut self, class: &str, owner: &str, field: &str, reference: &str) {
        if let Some(items) = self
            .record_mut(class, owner)
            .and_then(|r| r.get_mut(field))
            .and_then(Value::as_array_mut)
        {
            items.retain(|v| v.as_str() != Some(reference));
        }
    }

    fn handle(&mut self, class: &str, message: &str, args: &[Value]) -> Result<Value, XapiError> {
        match (class, message) {
            ("VM", "clone" | "copy") => {
                let vm = self.clone_vm(arg_str(args, 0), arg_str(args, 1), None)?;
                Ok(json!(vm))
            }
            ("VM", "snapshot") => {
                let vm = self.clone_vm(arg_str(args, 0), arg_str(args, 1), Some(false))?;
                Ok(json!(vm))
            }
            ("VM", "checkpoint") => {
                let vm = self.clone_vm(arg_str(args, 0), arg_str(args, 1), Some(true))?;
                Ok(json!(vm))
            }
            ("VM", "revert") => self.revert(arg_str(args, 0)).map(|_| Value::Null),
            ("VM", "provision") => {
                let vm = arg_str(args, 0);
                self.record(class, vm)?;
                if let Some(other) = self
                    .record_mut(class, vm)
                    .and_then(|r| r.get_mut("other_config"))
                    .and_then(Value::as_object_mut)
                {
                    other.remove("disks");
                }
                Ok(Value::Null)
            }
            ("VM", "start" | "start_on" | "resume" | "resume_on") => {
                self.start_vm(arg_str(args, 0)).map(|_| Value::Null)
            }
            ("VM", "hard_shutdown" | "clean_shutdown" | "hard_reboot" | "clean_reboot") => {
                let vm = arg_str(args, 0).to_string();
                let halt = matches!(message, "hard_shutdown" | "clean_shutdown");
                if halt {
                    self.set(class, &vm, "power_state", json!("Halted"))?;
                    let vbds = ref_list(self.record(class, &vm)?, "VBDs");
                    for vbd in vbds {
                        self.set("VBD", &vbd, "currently_attached", json!(false))?;
                    }
                } else {
                    self.record(class, &vm)?;
                }
                Ok(Value::Null)
            }
            ("VM", "suspend") => {
                self.set(class, arg_str(args, 0), "power_state", json!("Suspended"))?;
                Ok(Value::Null)
            }
            ("VM", "set_memory_limits") => self.set_memory_limits(args).map(|_| Value::Null),
            ("VM", "set_VCPUs_max") => {
                let vm = arg_str(args, 0);
                let record = self.record(class, vm)?;
                if str_field(record, "power_state") != "Halted" {
                    return Err(remote("VM_BAD_POWER_STATE", &[vm, "halted", "running"]));
                }
                self.set(class, vm, "VCPUs_max", arg(args, 1))?;
                Ok(Value::Null)
            }
            ("VM", "set_VCPUs_at_startup") => {
                let vm = arg_str(args, 0);
                let max = self.record(class, vm)?.get("VCPUs_max").and_then(Value::as_i64);
                let wanted = args.get(1).and_then(Value::as_i64).unwrap_or_default();
                if wanted < 1 || max.is_some_and(|max| wanted > max) {
                    return Err(remote(
                        "VALUE_NOT_SUPPORTED",
                        &["VCPU values must satisfy: 0 < VCPUs_at_startup ≤ VCPUs_max"],
                    ));
                }
                self.set(class, vm, "VCPUs_at_startup", json!(wanted))?;
                Ok(Value::Null)
            }
            ("VM", "get_allowed_VBD_devices") => {
                let used: Vec<String> = ref_list(self.record(class, arg_str(args, 0))?, "VBDs")
                    .iter()
                    .filter_map(|vbd| self.record("VBD", vbd).ok())
                    .map(|r| str_field(r, "userdevice").to_string())
                    .collect();
                let free: Vec<String> = (0..16)
                    .map(|n| n.to_string())
                    .filter(|d| !used.contains(d))
                    .collect();
                Ok(json!(free))
            }
            ("VBD" | "VIF" | "PBD", "plug") => {
                self.set(class, arg_str(args, 0), "currently_attached", json!(true))?;
                Ok(Value::Null)
            }
            ("VBD" | "VIF" | "PBD", "unplug" | "unplug_force") => {
                self.set(class, arg_str(args, 0), "currently_attached", json!(false))?;
                Ok(Value::Null)
            }
            ("VBD", "insert") => {
                let vbd = arg_str(args, 0).to_string();
                self.set(class, &vbd, "VDI", arg(args, 1))?;
                self.set(class, &vbd, "empty", json!(false))?;
                Ok(Value::Null)
            }
            ("VBD", "eject") => {
                let vbd = arg_str(args, 0).to_string();
                self.set(class, &vbd, "VDI", json!(NULL_REF))?;
                self.set(class, &vbd, "empty", json!(true))?;
                Ok(Value::Null)
            }
            ("VIF", "move") => {
                let vif = arg_str(args, 0).to_string();
                let old = str_field(self.record(class, &vif)?, "network").to_string();
                let new = arg_str(args, 1).to_string();
                self.pull_ref("network", &old, "VIFs", &vif);
                self.set(class, &vif, "network", json!(new))?;
                self.push_ref("network", &new, "VIFs", &vif);
                Ok(Value::Null)
            }
            ("SR", "create") => self.create_sr(args),
            ("SR", "forget" | "destroy") => {
                let sr = arg_str(args, 0).to_string();
                let pbds = ref_list(self.record(class, &sr)?, "PBDs");
                for pbd in pbds {
                    self.remove("PBD", &pbd)?;
                }
                self.remove(class, &sr)?;
                Ok(Value::Null)
            }
            ("SR", "scan") => self.record(class, arg_str(args, 0)).map(|_| Value::Null),
            ("pool", "join" | "join_force") => {
                self.member_of = Some(arg_str(args, 0).to_string());
                Ok(Value::Null)
            }
            ("pool", "eject") => {
                let host = self.remove("host", arg_str(args, 0))?;
                let metrics = str_field(&host, "metrics").to_string();
                let _ = self.remove("host_metrics", &metrics);
                Ok(Value::Null)
            }
            ("pool", "management_reconfigure") => {
                let network = arg_str(args, 0).to_string();
                self.record("network", &network)?;
                if let Some(pifs) = self.objects.get_mut("PIF") {
                    for pif in pifs.values_mut() {
                        let on = str_field(pif, "network") == network;
                        pif.insert("management".into(), json!(on));
                    }
                }
                Ok(Value::Null)
            }
            ("pool", "create_VLAN_from_PIF") => self.create_vlan(args),
            ("VLAN", "destroy") => {
                let vlan = self.remove(class, arg_str(args, 0))?;
                let untagged = str_field(&vlan, "untagged_PIF").to_string();
                let _ = self.remove("PIF", &untagged);
                Ok(Value::Null)
            }
            ("PIF", "reconfigure_ip") => {
                let pif = arg_str(args, 0).to_string();
                let mode = arg_str(args, 1).to_string();
                let ip = match mode.as_str() {
                    "DHCP" => self.dhcp_ip.clone().unwrap_or_default(),
                    "Static" => arg_str(args, 2).to_string(),
                    _ => String::new(),
                };
                self.set(class, &pif, "ip_configuration_mode", json!(mode))?;
                self.set(class, &pif, "IP", json!(ip))?;
                self.set(class, &pif, "netmask", arg(args, 3))?;
                self.set(class, &pif, "gateway", arg(args, 4))?;
                self.set(class, &pif, "DNS", arg(args, 5))?;
                Ok(Value::Null)
            }
            ("task", "create") => {
                let mut record = Record::new();
                record.insert("name_label".into(), arg(args, 0));
                record.insert("name_description".into(), arg(args, 1));
                Ok(json!(self.insert(class, record)))
            }
            ("task", "get_status") => {
                let task = arg_str(args, 0).to_string();
                self.record(class, &task)?;
                let status = self
                    .task_statuses
                    .pop_front()
                    .unwrap_or_else(|| "success".to_string());
                self.set(class, &task, "status", json!(status))?;
                if status == "success" {
                    self.set(class, &task, "progress", json!(1.0))?;
                }
                Ok(json!(status))
            }
            ("task", "cancel") => {
                self.set(class, arg_str(args, 0), "status", json!("cancelled"))?;
                Ok(Value::Null)
            }
            _ => self.handle_generic(class, message, args),
        }
    }

    fn handle_generic(&mut self, class: &str, message: &str, args: &[Value]) -> Result<Value, XapiError> {
        match message {
            "get_all" => Ok(json!(
                self.objects
                    .get(class)
                    .map(|o| o.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            )),
            "get_all_records" => Ok(Value::Object(
                self.objects
                    .get(class)
                    .map(|o| {
                        o.iter()
                            .map(|(r, rec)| (r.clone(), Value::Object(rec.clone())))
                            .collect()
                    })
                    .unwrap_or_default(),
            )),
            "get_record" => Ok(Value::Object(self.record(class, arg_str(args, 0))?.clone())),
            "get_by_uuid" => {
                let uuid = arg_str(args, 0);
                self.by_uuid(class, uuid)
                    .map(|r| json!(r))
                    .ok_or_else(|| remote(codes::UUID_INVALID, &[class, uuid]))
            }
            "get_by_name_label" => {
                let label = arg_str(args, 0);
                Ok(json!(
                    self.objects
                        .get(class)
                        .map(|o| {
                            o.iter()
                                .filter(|(_, r)| str_field(r, "name_label") == label)
                                .map(|(reference, _)| reference.clone())
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                ))
            }
            "create" => {
                let record = match arg(args, 0) {
                    Value::Object(map) => map,
                    _ => Record::new(),
                };
                Ok(json!(self.insert(class, record)))
            }
            "destroy" => self.remove(class, arg_str(args, 0)).map(|_| Value::Null),
            _ => {
                if let Some(field) = message.strip_prefix("get_") {
                    let record = self.record(class, arg_str(args, 0))?;
                    return Ok(record.get(field).cloned().unwrap_or(Value::Null));
                }
                if let Some(field) = message.strip_prefix("set_") {
                    self.set(class, arg_str(args, 0), field, arg(args, 1))?;
                    return Ok(Value::Null);
                }
                if let Some(field) = message.strip_prefix("add_to_") {
                    let record = self
                        .record_mut(class, arg_str(args, 0))
                        .ok_or_else(|| handle_invalid(class, arg_str(args, 0)))?;
                    let map = record.entry(field.to_string()).or_insert_with(|| json!({}));
                    if let Some(map) = map.as_object_mut() {
                        map.insert(arg_str(args, 1).to_string(), arg(args, 2));
                    }
                    return Ok(Value::Null);
                }
                if let Some(field) = message.strip_prefix("remove_from_") {
                    let key = arg_str(args, 1).to_string();
                    let record = self
                        .record_mut(class, arg_str(args, 0))
                        .ok_or_else(|| handle_invalid(class, arg_str(args, 0)))?;
                    if let Some(map) = record.get_mut(field).and_then(Value::as_object_mut) {
                        map.remove(&key);
                    }
                    return Ok(Value::Null);
                }
                let method = format!("{class}.{message}");
                Err(remote(codes::MESSAGE_METHOD_UNKNOWN, &[method.as_str()]))
            }
        }
    }

    fn copy_vdi(&mut self, vdi: &str) -> Result<String, XapiError> {
        let mut record = self.record("VDI", vdi)?.clone();
        record.remove("uuid");
        record.insert("VBDs".into(), json!([]));
        Ok(self.insert("VDI", record))
    }

    /// Clone `source`; `snapshot` is `Some(with_memory)` for snapshots.
    fn clone_vm(&mut self, source: &str, name: &str, snapshot: Option<bool>) -> Result<String, XapiError> {
        let original = self.record("VM", source)?.clone();
        let mut record = original.clone();
        record.remove("uuid");
        record.insert("name_label".into(), json!(name));
        for list in ["VBDs", "VIFs", "snapshots"] {
            record.insert(list.into(), json!([]));
        }
        record.insert("guest_metrics".into(), json!(NULL_REF));
        record.insert("power_state".into(), json!("Halted"));
        if let Some(with_memory) = snapshot {
            let power = str_field(&original, "power_state").to_string();
            record.insert("is_a_snapshot".into(), json!(true));
            record.insert("is_a_template".into(), json!(true));
            record.insert("snapshot_of".into(), json!(source));
            record.insert(
                "snapshot_info".into(),
                json!({"power-state-at-snapshot": power}),
            );
            if with_memory {
                record.insert("power_state".into(), json!("Suspended"));
            }
        }
        let clone = self.insert("VM", record);

        for vbd in ref_list(&original, "VBDs") {
            let mut copy = self.record("VBD", &vbd)?.clone();
            copy.remove("uuid");
            copy.insert("VM".into(), json!(clone));
            copy.insert("currently_attached".into(), json!(false));
            let vdi = str_field(&copy, "VDI").to_string();
            if str_field(&copy, "type") == "Disk" && vdi != NULL_REF && !vdi.is_empty() {
                let new_vdi = self.copy_vdi(&vdi)?;
                copy.insert("VDI".into(), json!(new_vdi));
            }
            self.insert("VBD", copy);
        }
        for vif in ref_list(&original, "VIFs") {
            let mut copy = self.record("VIF", &vif)?.clone();
            copy.remove("uuid");
            copy.insert("VM".into(), json!(clone));
            copy.insert("currently_attached".into(), json!(false));
            self.insert("VIF", copy);
        }
        if snapshot.is_some() {
            self.push_ref("VM", source, "snapshots", &clone);
        }
        Ok(clone)
    }

    /// Roll the snapshot's VM back: every disk gets a fresh VDI.
    fn revert(&mut self, snapshot: &str) -> Result<(), XapiError> {
        let record = self.record("VM", snapshot)?.clone();
        let vm = str_field(&record, "snapshot_of").to_string();
        let power = if str_field(&record, "power_state") == "Suspended" {
            "Suspended"
        } else {
            "Halted"
        };
        let vbds = ref_list(self.record("VM", &vm)?, "VBDs");
        for vbd in vbds {
            let disk = self.record("VBD", &vbd)?.clone();
            let old = str_field(&disk, "VDI").to_string();
            if str_field(&disk, "type") != "Disk" || old == NULL_REF || old.is_empty() {
                continue;
            }
            let new = self.copy_vdi(&old)?;
            self.pull_ref("VDI", &old, "VBDs", &vbd);
            self.set("VBD", &vbd, "VDI", json!(new))?;
            self.push_ref("VDI", &new, "VBDs", &vbd);
            self.remove("VDI", &old)?;
        }
        self.set("VM", &vm, "power_state", json!(power))?;
        self.set("VM", &vm, "guest_metrics", json!(NULL_REF))?;
        Ok(())
    }

    fn start_vm(&mut self, vm: &str) -> Result<(), XapiError> {
        let record = self.record("VM", vm)?.clone();
        if record.get("is_a_template").and_then(Value::as_bool) == Some(true) {
            return Err(remote("VM_IS_TEMPLATE", &[vm]));
        }
        if str_field(&record, "power_state") == "Running" {
            return Err(remote("VM_BAD_POWER_STATE", &[vm, "halted", "running"]));
        }
        self.set("VM", vm, "power_state", json!("Running"))?;
        for vbd in ref_list(&record, "VBDs") {
            self.set("VBD", &vbd, "currently_attached", json!(true))?;
        }
        if !self.guest_networks.is_empty() {
            let networks = json!(self.guest_networks);
            let mut metrics = Record::new();
            metrics.insert("networks".into(), networks);
            let metrics = self.insert("VM_guest_metrics", metrics);
            self.set("VM", vm, "guest_metrics", json!(metrics))?;
        }
        Ok(())
    }

    fn set_memory_limits(&mut self, args: &[Value]) -> Result<(), XapiError> {
        let vm = arg_str(args, 0).to_string();
        let limits: Vec<i64> = (1..5)
            .map(|i| args.get(i).and_then(Value::as_i64).unwrap_or_default())
            .collect();
        let &[static_min, static_max, dynamic_min, dynamic_max] = limits.as_slice() else {
            return Err(remote("MEMORY_CONSTRAINT_VIOLATION", &["missing limits"]));
        };
        if !(static_min <= dynamic_min && dynamic_min <= dynamic_max && dynamic_max <= static_max) {
            return Err(remote(
                "MEMORY_CONSTRAINT_VIOLATION",
                &["static_min ≤ dynamic_min ≤ dynamic_max ≤ static_max"],
            ));
        }
        for (field, value) in [
            ("memory_static_min", static_min),
            ("memory_static_max", static_max),
            ("memory_dynamic_min", dynamic_min),
            ("memory_dynamic_max", dynamic_max),
        ] {
            self.set("VM", &vm, field, json!(value))?;
        }
        Ok(())
    }

    fn create_sr(&mut self, args: &[Value]) -> Result<Value, XapiError> {
        let host = arg_str(args, 0).to_string();
        self.record("host", &host)?;
        let mut sr = Record::new();
        sr.insert("physical_size".into(), arg(args, 2));
        sr.insert("name_label".into(), arg(args, 3));
        sr.insert("name_description".into(), arg(args, 4));
        sr.insert("type".into(), arg(args, 5));
        sr.insert("content_type".into(), arg(args, 6));
        sr.insert("shared".into(), arg(args, 7));
        sr.insert("sm_config".into(), arg(args, 8));
        let sr = self.insert("SR", sr);
        let mut pbd = Record::new();
        pbd.insert("host".into(), json!(host));
        pbd.insert("SR".into(), json!(sr));
        pbd.insert("device_config".into(), arg(args, 1));
        pbd.insert("currently_attached".into(), json!(true));
        self.insert("PBD", pbd);
        Ok(json!(sr))
    }

    fn create_vlan(&mut self, args: &[Value]) -> Result<Value, XapiError> {
        let tagged = arg_str(args, 0).to_string();
        let network = arg_str(args, 1).to_string();
        let tag = args.get(2).and_then(Value::as_i64).unwrap_or_default();
        let parent = self.record("PIF", &tagged)?.clone();
        self.record("network", &network)?;
        let mut vlan = Record::new();
        vlan.insert("tagged_PIF".into(), json!(tagged));
        vlan.insert("tag".into(), json!(tag));
        let vlan = self.insert("VLAN", vlan);
        let mut pif = Record::new();
        pif.insert("device".into(), json!(str_field(&parent, "device")));
        pif.insert("host".into(), json!(str_field(&parent, "host")));
        pif.insert("network".into(), json!(network));
        pif.insert("VLAN".into(), json!(tag));
        pif.insert("VLAN_master_of".into(), json!(vlan));
        let pif = self.insert("PIF", pif);
        self.set("VLAN", &vlan, "untagged_PIF", json!(pif))?;
        Ok(json!([pif]))
    }
}

/// Several fakes reachable by address, with pool joins and ejects carried
/// between them.
#[derive(Clone, Default)]
pub struct FakeCluster {
    hosts: Arc<Mutex<BTreeMap<String, FakeXapi>>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a standalone host reachable at `address`.
    pub fn add_standalone(&self, address: &str, host_uuid: &str) -> FakeXapi {
        let fake = FakeXapi::standalone(address, host_uuid);
        self.lock().insert(address.to_string(), fake.clone());
        fake
    }

    /// Operation context with `address` as the coordinator.
    pub async fn context(&self, address: &str) -> ProviderResult<ProviderContext> {
        ProviderContext::connect(
            ProviderConfig::new(address, "root", "secret"),
            Arc::new(self.clone()),
            CancellationToken::new(),
        )
        .await
    }

    pub fn host(&self, address: &str) -> Option<FakeXapi> {
        self.lock().get(host_address(address)).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, FakeXapi>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy the supporter's host into the coordinator at `master`.
    fn complete_join(&self, supporter: &FakeXapi, master: &str) -> Result<(), XapiError> {
        let coordinator = self
            .host(master)
            .ok_or_else(|| remote("HOST_UNREACHABLE", &[master]))?;
        let uuid = supporter.own_host_uuid().unwrap_or_default();
        let (_, host) = supporter
            .all(ObjectKind::Host)
            .into_iter()
            .find(|(_, h)| h["uuid"] == uuid.as_str())
            .ok_or_else(|| remote(codes::UUID_INVALID, &["host", uuid.as_str()]))?;
        let live = coordinator.lock().join_live;
        let metrics = coordinator.insert(ObjectKind::HostMetrics, json!({"live": live}));
        coordinator.insert(
            ObjectKind::Host,
            json!({
                "uuid": uuid,
                "name_label": host["name_label"],
                "address": host["address"],
                "metrics": metrics,
            }),
        );
        Ok(())
    }

    /// Return the ejected host to standalone operation.
    fn complete_eject(&self, host_uuid: &str) {
        for fake in self.lock().values() {
            if fake.own_host_uuid().as_deref() == Some(host_uuid) {
                fake.set_member_of(None);
            }
        }
    }
}

struct ClusterTransport {
    cluster: FakeCluster,
    host: FakeXapi,
}

#[async_trait]
impl Transport for ClusterTransport {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, XapiError> {
        match method {
            "pool.join" | "pool.join_force" => {
                let master = params.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
                let result = self.host.dispatch(method, params)?;
                self.cluster.complete_join(&self.host, &master)?;
                Ok(result)
            }
            "pool.eject" => {
                let uuid = params
                    .get(1)
                    .and_then(Value::as_str)
                    .and_then(|r| self.host.record(ObjectKind::Host, &OpaqueRef::new(r)))
                    .and_then(|h| h["uuid"].as_str().map(str::to_string));
                let result = self.host.dispatch(method, params)?;
                if let Some(uuid) = uuid {
                    self.cluster.complete_eject(&uuid);
                }
                Ok(result)
            }
            _ => self.host.dispatch(method, params),
        }
    }
}

#[async_trait]
impl Connector for FakeCluster {
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Session, XapiError> {
        let fake = self.host(host).ok_or_else(|| XapiError::Transport {
            method: "session.login_with_password".to_string(),
            reason: format!("no route to host {}", host_address(host)),
        })?;
        let transport = Arc::new(ClusterTransport {
            cluster: self.clone(),
            host: fake,
        });
        Session::login(transport, host_url(host), username, password).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xapi::records::{VmRecord, VbdRecord};

    #[tokio::test]
    async fn generic_messages_work_for_any_class() {
        let fake = FakeXapi::new();
        let net = fake.insert(ObjectKind::Network, json!({"uuid": "n1", "name_label": "lan"}));
        let session = fake.session();
        assert_eq!(session.get_by_uuid(ObjectKind::Network, "n1").await.unwrap(), net);
        session
            .set_field(ObjectKind::Network, &net, "MTU", json!(9000))
            .await
            .unwrap();
        let mtu: i64 = session.get_field(ObjectKind::Network, &net, "MTU").await.unwrap();
        assert_eq!(mtu, 9000);
        let err = session.get_by_uuid(ObjectKind::Network, "n2").await.unwrap_err();
        assert!(err.is_code(codes::UUID_INVALID));
        assert_eq!(fake.mutations(), vec!["network.set_MTU"]);
    }

    #[tokio::test]
    async fn clone_copies_disks_and_keeps_back_links() {
        let fake = FakeXapi::new();
        let vm = fake.insert(ObjectKind::Vm, json!({"name_label": "tpl", "is_a_template": true}));
        let vdi = fake.insert(ObjectKind::Vdi, json!({"name_label": "root"}));
        fake.insert(ObjectKind::Vbd, json!({"VM": vm, "VDI": vdi, "userdevice": "0"}));
        let session = fake.session();
        let clone: OpaqueRef = session
            .invoke("VM.clone", vec![(&vm).into(), json!("copy")])
            .await
            .unwrap();
        let record: VmRecord = session.get_record(ObjectKind::Vm, &clone).await.unwrap();
        assert_eq!(record.vbds.len(), 1);
        let vbd: VbdRecord = session.get_record(ObjectKind::Vbd, &record.vbds[0]).await.unwrap();
        assert_ne!(vbd.vdi, vdi);
        assert_eq!(fake.count(ObjectKind::Vdi), 2);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let fake = FakeXapi::new();
        let vdi = fake.insert(ObjectKind::Vdi, json!({}));
        fake.fail_times("VDI.destroy", 1, codes::VDI_IN_USE, &[]);
        let session = fake.session();
        assert!(session.destroy(ObjectKind::Vdi, &vdi).await.unwrap_err().is_code(codes::VDI_IN_USE));
        session.destroy(ObjectKind::Vdi, &vdi).await.unwrap();
    }

    #[tokio::test]
    async fn cluster_join_moves_host_to_coordinator() {
        let cluster = FakeCluster::new();
        let coordinator = cluster.add_standalone("10.0.0.1", "host-a");
        cluster.add_standalone("10.0.0.2", "host-b");
        let supporter = cluster.connect("10.0.0.2", "root", "pw").await.unwrap();
        supporter
            .invoke_unit("pool.join", vec![json!("10.0.0.1"), json!("root"), json!("pw")])
            .await
            .unwrap();
        assert!(coordinator.find_by_uuid(ObjectKind::Host, "host-b").is_some());
        let err = cluster.connect("10.0.0.2", "root", "pw").await.unwrap_err();
        assert!(err.is_code(codes::HOST_IS_SLAVE));
    }
}
