//! Shared types for the vSphere binding and the coordination core.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection settings for a vCenter / ESXi endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct VsphereConfig {
    /// vCenter or ESXi hostname / IP (e.g. "vcenter.lab.local")
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username (e.g. "administrator@vsphere.local")
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification (self-signed labs)
    #[serde(default)]
    pub insecure: bool,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 { 443 }
fn default_timeout() -> u64 { 30 }

impl Default for VsphereConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            port: 443,
            insecure: false,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for VsphereConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsphereConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("insecure", &self.insecure)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Config view that is safe to log or return to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsphereConfigSafe {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub insecure: bool,
}

impl From<&VsphereConfig> for VsphereConfigSafe {
    fn from(c: &VsphereConfig) -> Self {
        Self {
            host: c.host.clone(),
            port: c.port,
            username: c.username.clone(),
            insecure: c.insecure,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Coordination
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Timeouts and polling cadence for the task waiter and change watcher.
///
/// Passed by value into every component so tests can run side by side with
/// different settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Task wait bound when the caller does not supply one.
    #[serde(default = "CoordinationConfig::default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "CoordinationConfig::default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,
    /// Retries for a task status query that failed transiently.
    #[serde(default = "CoordinationConfig::default_task_query_retries")]
    pub task_query_retries: u32,
    /// First retry delay; doubles per consecutive failure.
    #[serde(default = "CoordinationConfig::default_task_retry_backoff_ms")]
    pub task_retry_backoff_ms: u64,
    #[serde(default = "CoordinationConfig::default_watch_max_wait_secs")]
    pub watch_max_wait_secs: u64,
    #[serde(default = "CoordinationConfig::default_watch_max_iterations")]
    pub watch_max_iterations: u32,
}

impl CoordinationConfig {
    pub const MIN_POLL_INTERVAL_MS: u64 = 100;

    pub fn default_task_timeout_secs() -> u64 { 300 }
    pub fn default_task_poll_interval_ms() -> u64 { 1000 }
    pub fn default_task_query_retries() -> u32 { 3 }
    pub fn default_task_retry_backoff_ms() -> u64 { 500 }
    pub fn default_watch_max_wait_secs() -> u64 { 30 }
    pub fn default_watch_max_iterations() -> u32 { 1 }

    /// Poll interval, floored so a zero or tiny value cannot busy-loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms.max(Self::MIN_POLL_INTERVAL_MS))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.task_timeout_secs == 0 {
            return Err("task_timeout_secs must be greater than zero".into());
        }
        if self.task_poll_interval_ms == 0 {
            return Err("task_poll_interval_ms must be greater than zero".into());
        }
        if self.watch_max_wait_secs == 0 {
            return Err("watch_max_wait_secs must be greater than zero".into());
        }
        Ok(())
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: Self::default_task_timeout_secs(),
            task_poll_interval_ms: Self::default_task_poll_interval_ms(),
            task_query_retries: Self::default_task_query_retries(),
            task_retry_backoff_ms: Self::default_task_retry_backoff_ms(),
            watch_max_wait_secs: Self::default_watch_max_wait_secs(),
            watch_max_iterations: Self::default_watch_max_iterations(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Managed Object References
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inventory kinds the resolver and watcher understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    VirtualMachine,
    HostSystem,
    Datastore,
    Network,
    Datacenter,
    ClusterComputeResource,
    /// Cluster or standalone host
    ComputeResource,
    ResourcePool,
    Folder,
    StoragePod,
}

impl ObjectKind {
    /// vim25 type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtualMachine => "VirtualMachine",
            Self::HostSystem => "HostSystem",
            Self::Datastore => "Datastore",
            Self::Network => "Network",
            Self::Datacenter => "Datacenter",
            Self::ClusterComputeResource => "ClusterComputeResource",
            Self::ComputeResource => "ComputeResource",
            Self::ResourcePool => "ResourcePool",
            Self::Folder => "Folder",
            Self::StoragePod => "StoragePod",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    /// Accepts vim25 names plus the short aliases operators tend to type.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "virtualmachine" | "vm" => Ok(Self::VirtualMachine),
            "hostsystem" | "host" => Ok(Self::HostSystem),
            "datastore" => Ok(Self::Datastore),
            "network" | "distributedvirtualportgroup" => Ok(Self::Network),
            "datacenter" => Ok(Self::Datacenter),
            "clustercomputeresource" | "cluster" => Ok(Self::ClusterComputeResource),
            "computeresource" => Ok(Self::ComputeResource),
            "resourcepool" => Ok(Self::ResourcePool),
            "folder" => Ok(Self::Folder),
            "storagepod" | "datastorecluster" => Ok(Self::StoragePod),
            other => Err(format!("Unsupported object type '{other}'")),
        }
    }
}

/// Opaque reference to a remote managed object (vim25 `ManagedObjectReference`).
///
/// The REST API uses the same identifiers (`vm-42`), so references from either
/// binding are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    /// Display name, when known. Not part of the remote identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into(), name: None }
    }

    pub fn named(kind: impl Into<String>, value: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into(), name: Some(name.into()) }
    }

    /// Name if known, otherwise the moref id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.value)
    }

    pub fn same_object(&self, other: &ObjectRef) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle of a remote asynchronous operation (a vim25 `Task` object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

impl TaskRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Maps vim25 `TaskInfoState` values.
    pub fn from_vim(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Succeeded),
            "error" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One observation of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default)]
    pub progress: Option<u8>,
    /// Remote failure detail, only when `state == Failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Result payload, only when `state == Succeeded`.
    #[serde(default)]
    pub result: Option<Value>,
}

impl TaskStatus {
    pub fn running(progress: Option<u8>) -> Self {
        Self { state: TaskState::Running, progress, error: None, result: None }
    }

    pub fn succeeded(result: Option<Value>) -> Self {
        Self { state: TaskState::Succeeded, progress: Some(100), error: None, result }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { state: TaskState::Failed, progress: None, error: Some(error.into()), result: None }
    }
}

/// What a mutating call handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    /// Completed synchronously.
    Done(Option<Value>),
    /// Accepted; completion must be awaited.
    Task(TaskRef),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Snapshot tree node as reported by the remote (`VirtualMachineSnapshotTree`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub reference: ObjectRef,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub create_time: Option<String>,
    /// VM power state captured with the snapshot
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub quiesced: bool,
    /// Children in creation order
    #[serde(default)]
    pub children: Vec<RemoteSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSnapshotSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Snapshot the VM's memory state
    #[serde(default)]
    pub memory: bool,
    /// Quiesce the guest file system
    #[serde(default)]
    pub quiesce: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Property Collector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which objects a watch session covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchTargets {
    /// Explicit objects.
    Objects(Vec<ObjectRef>),
    /// Every object of a kind, across the whole inventory.
    Kind(ObjectKind),
}

/// Object + property set a change cursor is scoped to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSpec {
    pub targets: WatchTargets,
    pub properties: Vec<String>,
}

/// Server-side state backing one change cursor.
///
/// The collector is private to one watch session, so destroying it cleans up
/// its filter too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorHandle {
    pub collector: ObjectRef,
    pub filter: ObjectRef,
    #[serde(default)]
    pub view: Option<ObjectRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub name: String,
    /// `add`, `remove`, `assign`, `indirectRemove`
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub obj: ObjectRef,
    /// `enter`, `modify`, `leave`
    pub kind: String,
    pub changes: Vec<PropertyChange>,
}

/// One delta returned by a wait-for-updates call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBatch {
    /// Cursor token to pass on the next call.
    pub version: String,
    pub objects: Vec<ObjectUpdate>,
}

impl UpdateBatch {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Properties of one object from a retrieve call, keyed by property path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectProperties {
    pub obj: ObjectRef,
    pub props: Map<String, Value>,
}

impl ObjectProperties {
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.props.get(path)
    }

    pub fn str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM Power State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmPowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    #[default]
    #[serde(other)]
    Unknown,
}

impl VmPowerState {
    /// Maps vim25 `VirtualMachinePowerState` values.
    pub fn from_vim(s: &str) -> Self {
        match s {
            "poweredOn" => Self::PoweredOn,
            "poweredOff" => Self::PoweredOff,
            "suspended" => Self::Suspended,
            _ => Self::Unknown,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  REST Inventory Summaries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Concise VM summary (from `GET /api/vcenter/vm`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    /// Managed-object ID (e.g. "vm-42")
    pub vm: String,
    pub name: String,
    #[serde(default)]
    pub power_state: VmPowerState,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default, rename = "memory_size_MiB")]
    pub memory_size_mib: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSummary {
    pub host: String,
    pub name: String,
    #[serde(default)]
    pub connection_state: Option<String>,
    #[serde(default)]
    pub power_state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreSummary {
    pub datastore: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub ds_type: Option<String>,
    #[serde(default)]
    pub free_space: Option<u64>,
    #[serde(default)]
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub network: String,
    pub name: String,
    /// `STANDARD_PORTGROUP`, `DISTRIBUTED_PORTGROUP`, `OPAQUE_NETWORK`
    #[serde(default, rename = "type")]
    pub network_type: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM Create / Clone
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a new VM lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmPlacement {
    pub folder: ObjectRef,
    pub resource_pool: ObjectRef,
    /// Must carry its name; it becomes the `[datastore]` path prefix.
    pub datastore: ObjectRef,
    #[serde(default)]
    pub network: Option<ObjectRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCreateSpec {
    pub name: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
    pub guest_id: String,
    pub thin_provisioned: bool,
    #[serde(default)]
    pub annotation: Option<String>,
    pub placement: VmPlacement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCloneSpec {
    pub source: ObjectRef,
    pub name: String,
    pub folder: ObjectRef,
    pub resource_pool: ObjectRef,
    pub datastore: ObjectRef,
    #[serde(default)]
    pub power_on: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Performance / Metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfCounterInfo {
    pub key: i32,
    pub group: String,
    pub name: String,
    pub rollup_type: String,
    pub stats_type: String,
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

impl PerfCounterInfo {
    /// `group.name.rollup`, e.g. `net.transmitted.average`.
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.group, self.name, self.rollup_type)
    }
}

/// Latest sample series for one counter / instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfSeries {
    pub counter_id: i32,
    #[serde(default)]
    pub instance: String,
    pub values: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_kind_accepts_aliases() {
        assert_eq!("Host".parse::<ObjectKind>(), Ok(ObjectKind::HostSystem));
        assert_eq!("VirtualMachine".parse::<ObjectKind>(), Ok(ObjectKind::VirtualMachine));
        assert_eq!("datastorecluster".parse::<ObjectKind>(), Ok(ObjectKind::StoragePod));
        assert!("Toaster".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn task_state_from_vim() {
        assert_eq!(TaskState::from_vim("success"), Some(TaskState::Succeeded));
        assert_eq!(TaskState::from_vim("error"), Some(TaskState::Failed));
        assert_eq!(TaskState::from_vim("queued"), Some(TaskState::Queued));
        assert_eq!(TaskState::from_vim("bogus"), None);
    }

    #[test]
    fn coordination_defaults_are_explicit() {
        let c = CoordinationConfig::default();
        assert_eq!(c.task_timeout_secs, 300);
        assert_eq!(c.poll_interval(), Duration::from_secs(1));
        assert_eq!(c.task_query_retries, 3);
        assert!(c.validate().is_ok());

        let c = CoordinationConfig { task_poll_interval_ms: 1, ..CoordinationConfig::default() };
        assert_eq!(c.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn coordination_rejects_zero_timeout() {
        let c = CoordinationConfig { task_timeout_secs: 0, ..CoordinationConfig::default() };
        assert!(c.validate().is_err());
    }

    #[test]
    fn config_debug_hides_password() {
        let c = VsphereConfig { password: "hunter2".into(), ..VsphereConfig::default() };
        assert!(!format!("{c:?}").contains("hunter2"));
    }

    #[test]
    fn rest_vm_summary_parses() {
        let vm: VmSummary = serde_json::from_str(
            r#"{"vm":"vm-42","name":"web01","power_state":"POWERED_ON","cpu_count":2,"memory_size_MiB":4096}"#,
        )
        .unwrap();
        assert_eq!(vm.power_state, VmPowerState::PoweredOn);
        assert_eq!(vm.memory_size_mib, Some(4096));
    }
}
