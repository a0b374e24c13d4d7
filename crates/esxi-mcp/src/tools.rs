//! Tool table: schemas advertised by `tools/list` and argument decoding
//! for `tools/call`.

use crate::protocol::McpError;

use esxi_vsphere::types::CreateSnapshotSpec;
use esxi_vsphere::{CancelFlag, CustomVmRequest, InfraService, OperationResult, WatchRequest};
use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn tool(name: &'static str, description: &'static str, properties: Value, required: &[&str]) -> ToolSpec {
    ToolSpec {
        name,
        description,
        input_schema: json!({ "type": "object", "properties": properties, "required": required }),
    }
}

fn no_args(name: &'static str, description: &'static str) -> ToolSpec {
    ToolSpec { name, description, input_schema: json!({ "type": "object", "properties": {} }) }
}

fn string(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn vm_name() -> Value {
    json!({ "vm_name": string("Name of the virtual machine") })
}

fn task_timeout() -> Value {
    json!({ "type": "integer", "minimum": 1, "description": "Seconds to wait for each task (optional, server default otherwise)" })
}

fn host_name() -> Value {
    json!({ "host_name": string("Name of the host") })
}

pub fn tool_table() -> Vec<ToolSpec> {
    vec![
        tool(
            "authenticate",
            "Authenticate this session with the server API key",
            json!({ "key": string("API key") }),
            &["key"],
        ),
        tool(
            "create_vm",
            "Create a new virtual machine",
            json!({
                "name": string("VM name"),
                "cpu": { "type": "integer", "description": "Number of CPUs" },
                "memory": { "type": "integer", "description": "Memory in MB" },
                "datastore": string("Datastore name (optional)"),
                "network": string("Network name (optional)"),
            }),
            &["name", "cpu", "memory"],
        ),
        tool(
            "create_vm_custom",
            "Create a custom virtual machine with advanced configuration options",
            json!({
                "name": string("VM name"),
                "cpu": { "type": "integer", "description": "Number of CPUs" },
                "memory": { "type": "integer", "description": "Memory in MB" },
                "disk_size_gb": { "type": "integer", "description": "Disk size in GB", "default": CustomVmRequest::DEFAULT_DISK_SIZE_GB },
                "guest_id": { "type": "string", "description": "Guest OS identifier", "default": CustomVmRequest::DEFAULT_GUEST_ID },
                "datastore": string("Datastore name (optional)"),
                "network": string("Network name (optional)"),
                "thin_provisioned": { "type": "boolean", "description": "Use thin provisioning", "default": true },
                "annotation": string("VM annotation/description"),
            }),
            &["name", "cpu", "memory"],
        ),
        tool(
            "clone_vm",
            "Clone a virtual machine from a template or existing VM",
            json!({
                "template_name": string("Name of the template or VM to clone"),
                "new_name": string("Name for the new VM"),
            }),
            &["template_name", "new_name"],
        ),
        tool("delete_vm", "Delete a virtual machine", json!({ "name": string("VM name") }), &["name"]),
        tool("power_on_vm", "Power on a virtual machine", json!({ "name": string("VM name") }), &["name"]),
        tool("power_off_vm", "Power off a virtual machine", json!({ "name": string("VM name") }), &["name"]),
        no_args("list_vms", "List all virtual machines"),
        no_args("list_templates", "List all virtual machine templates"),
        no_args("list_hosts", "List all ESXi hosts"),
        no_args("list_networks", "List all networks"),
        no_args("list_datastores", "List all datastores with their details"),
        no_args("list_datastore_clusters", "List all datastore clusters (StoragePods) with their datastores"),
        no_args("list_performance_counters", "List all available performance counters"),
        tool("get_vm_details", "Get detailed information about a specific virtual machine", vm_name(), &["vm_name"]),
        tool("get_vm_performance", "Get performance data for a virtual machine", vm_name(), &["vm_name"]),
        tool("get_vm_summary_stats", "Get summary statistics for a virtual machine", vm_name(), &["vm_name"]),
        tool("get_host_details", "Get detailed information about a specific host", host_name(), &["host_name"]),
        tool("get_host_performance_metrics", "Get performance metrics for a specific host", host_name(), &["host_name"]),
        tool("get_host_hardware_health", "Get hardware health information for a specific host", host_name(), &["host_name"]),
        tool("get_host_performance", "Get detailed performance data for a specific host", host_name(), &["host_name"]),
        tool(
            "create_snapshot",
            "Create a snapshot of a virtual machine",
            json!({
                "vm_name": string("Name of the VM"),
                "snapshot_name": string("Name for the snapshot"),
                "description": { "type": "string", "description": "Snapshot description", "default": "" },
                "memory": { "type": "boolean", "description": "Include VM memory in snapshot", "default": false },
                "quiesce": { "type": "boolean", "description": "Quiesce guest file system", "default": false },
                "timeout_seconds": task_timeout(),
            }),
            &["vm_name", "snapshot_name"],
        ),
        tool(
            "remove_snapshot",
            "Remove a snapshot from a virtual machine",
            json!({
                "vm_name": string("Name of the VM"),
                "snapshot_name": string("Name of the snapshot to remove"),
                "remove_children": { "type": "boolean", "description": "Remove child snapshots", "default": true },
                "timeout_seconds": task_timeout(),
            }),
            &["vm_name", "snapshot_name"],
        ),
        tool(
            "revert_snapshot",
            "Revert a virtual machine to a specific snapshot",
            json!({
                "vm_name": string("Name of the VM"),
                "snapshot_name": string("Name of the snapshot to revert to"),
                "timeout_seconds": task_timeout(),
            }),
            &["vm_name", "snapshot_name"],
        ),
        tool("list_snapshots", "List all snapshots for a virtual machine", vm_name(), &["vm_name"]),
        tool(
            "remove_all_snapshots",
            "Remove all snapshots from a virtual machine",
            json!({ "vm_name": string("Name of the virtual machine"), "timeout_seconds": task_timeout() }),
            &["vm_name"],
        ),
        tool(
            "wait_for_updates",
            "Wait for property updates on vSphere objects",
            json!({
                "object_type": string("Object type (e.g., 'VirtualMachine', 'Host')"),
                "properties": { "type": "array", "items": { "type": "string" }, "description": "Properties to monitor" },
                "max_wait_seconds": { "type": "integer", "description": "Max wait time per iteration", "default": 30 },
                "max_iterations": { "type": "integer", "description": "Max number of iterations", "default": 1 },
                "objects": { "type": "array", "items": { "type": "string" }, "description": "Object names to watch (optional, all objects of the type otherwise)" },
            }),
            &["object_type", "properties"],
        ),
        tool(
            "wait_for_task",
            "Wait for a previously started vSphere task to finish",
            json!({
                "task_id": string("Task identifier, e.g. from a timed-out operation"),
                "timeout_seconds": { "type": "integer", "minimum": 1, "description": "Maximum time to wait (optional)" },
            }),
            &["task_id"],
        ),
    ]
}

/// Typed view over a `tools/call` arguments object.
pub struct Args<'a>(&'a Map<String, Value>);

impl<'a> Args<'a> {
    pub fn new(args: &'a Map<String, Value>) -> Self {
        Self(args)
    }

    fn present(&self, key: &str) -> Option<&'a Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn ill_typed(key: &str, expected: &str) -> McpError {
        McpError::invalid_params(format!("Argument '{key}' must be {expected}"))
    }

    pub fn string(&self, key: &str) -> Result<String, McpError> {
        self.opt_string(key)?
            .ok_or_else(|| McpError::invalid_params(format!("Missing required argument '{key}'")))
    }

    pub fn opt_string(&self, key: &str) -> Result<Option<String>, McpError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Self::ill_typed(key, "a string")),
        }
    }

    pub fn opt_u64(&self, key: &str) -> Result<Option<u64>, McpError> {
        match self.present(key) {
            None => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| Self::ill_typed(key, "a non-negative integer")),
        }
    }

    /// Optional bound in seconds; zero is rejected.
    pub fn opt_seconds(&self, key: &str) -> Result<Option<u64>, McpError> {
        match self.opt_u64(key)? {
            Some(0) => Err(Self::ill_typed(key, "a positive number of seconds")),
            other => Ok(other),
        }
    }

    pub fn u64(&self, key: &str) -> Result<u64, McpError> {
        self.opt_u64(key)?
            .ok_or_else(|| McpError::invalid_params(format!("Missing required argument '{key}'")))
    }

    pub fn u32(&self, key: &str) -> Result<u32, McpError> {
        u32::try_from(self.u64(key)?).map_err(|_| Self::ill_typed(key, "a 32-bit integer"))
    }

    pub fn opt_u32(&self, key: &str) -> Result<Option<u32>, McpError> {
        self.opt_u64(key)?
            .map(|v| u32::try_from(v).map_err(|_| Self::ill_typed(key, "a 32-bit integer")))
            .transpose()
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, McpError> {
        match self.present(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(Self::ill_typed(key, "a boolean")),
        }
    }

    pub fn opt_strings(&self, key: &str) -> Result<Option<Vec<String>>, McpError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| Self::ill_typed(key, "an array of strings")))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(Self::ill_typed(key, "an array of strings")),
        }
    }

    pub fn strings(&self, key: &str) -> Result<Vec<String>, McpError> {
        self.opt_strings(key)?
            .ok_or_else(|| McpError::invalid_params(format!("Missing required argument '{key}'")))
    }
}

/// A decoded tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    Authenticate { key: String },
    CreateVm { name: String, cpu: u32, memory_mb: u64, datastore: Option<String>, network: Option<String> },
    CreateVmCustom(CustomVmRequest),
    CloneVm { template_name: String, new_name: String },
    DeleteVm { name: String },
    PowerOnVm { name: String },
    PowerOffVm { name: String },
    ListVms,
    ListTemplates,
    ListHosts,
    ListNetworks,
    ListDatastores,
    ListDatastoreClusters,
    ListPerformanceCounters,
    VmDetails { vm_name: String },
    VmPerformance { vm_name: String },
    VmSummaryStats { vm_name: String },
    HostDetails { host_name: String },
    HostPerformanceMetrics { host_name: String },
    HostHardwareHealth { host_name: String },
    HostPerformance { host_name: String },
    CreateSnapshot { vm_name: String, spec: CreateSnapshotSpec, timeout_seconds: Option<u64> },
    RemoveSnapshot { vm_name: String, snapshot_name: String, remove_children: bool, timeout_seconds: Option<u64> },
    RevertSnapshot { vm_name: String, snapshot_name: String, timeout_seconds: Option<u64> },
    ListSnapshots { vm_name: String },
    RemoveAllSnapshots { vm_name: String, timeout_seconds: Option<u64> },
    WaitForUpdates(WatchRequest),
    WaitForTask { task_id: String, timeout_seconds: Option<u64> },
}

impl ToolCall {
    /// Decode `name` and its arguments. `Ok(None)` means no such tool.
    pub fn parse(name: &str, args: &Map<String, Value>) -> Result<Option<Self>, McpError> {
        let a = Args::new(args);
        let call = match name {
            "authenticate" => Self::Authenticate { key: a.string("key")? },
            "create_vm" => Self::CreateVm {
                name: a.string("name")?,
                cpu: a.u32("cpu")?,
                memory_mb: a.u64("memory")?,
                datastore: a.opt_string("datastore")?,
                network: a.opt_string("network")?,
            },
            "create_vm_custom" => {
                let mut request = CustomVmRequest::new(a.string("name")?, a.u32("cpu")?, a.u64("memory")?);
                if let Some(disk) = a.opt_u64("disk_size_gb")? {
                    request.disk_size_gb = disk;
                }
                if let Some(guest_id) = a.opt_string("guest_id")? {
                    request.guest_id = guest_id;
                }
                request.datastore = a.opt_string("datastore")?;
                request.network = a.opt_string("network")?;
                request.thin_provisioned = a.bool_or("thin_provisioned", true)?;
                request.annotation = a.opt_string("annotation")?;
                Self::CreateVmCustom(request)
            }
            "clone_vm" => Self::CloneVm { template_name: a.string("template_name")?, new_name: a.string("new_name")? },
            "delete_vm" => Self::DeleteVm { name: a.string("name")? },
            "power_on_vm" => Self::PowerOnVm { name: a.string("name")? },
            "power_off_vm" => Self::PowerOffVm { name: a.string("name")? },
            "list_vms" => Self::ListVms,
            "list_templates" => Self::ListTemplates,
            "list_hosts" => Self::ListHosts,
            "list_networks" => Self::ListNetworks,
            "list_datastores" => Self::ListDatastores,
            "list_datastore_clusters" => Self::ListDatastoreClusters,
            "list_performance_counters" => Self::ListPerformanceCounters,
            "get_vm_details" => Self::VmDetails { vm_name: a.string("vm_name")? },
            "get_vm_performance" => Self::VmPerformance { vm_name: a.string("vm_name")? },
            "get_vm_summary_stats" => Self::VmSummaryStats { vm_name: a.string("vm_name")? },
            "get_host_details" => Self::HostDetails { host_name: a.string("host_name")? },
            "get_host_performance_metrics" => Self::HostPerformanceMetrics { host_name: a.string("host_name")? },
            "get_host_hardware_health" => Self::HostHardwareHealth { host_name: a.string("host_name")? },
            "get_host_performance" => Self::HostPerformance { host_name: a.string("host_name")? },
            "create_snapshot" => Self::CreateSnapshot {
                vm_name: a.string("vm_name")?,
                spec: CreateSnapshotSpec {
                    name: a.string("snapshot_name")?,
                    description: a.opt_string("description")?.unwrap_or_default(),
                    memory: a.bool_or("memory", false)?,
                    quiesce: a.bool_or("quiesce", false)?,
                },
                timeout_seconds: a.opt_seconds("timeout_seconds")?,
            },
            "remove_snapshot" => Self::RemoveSnapshot {
                vm_name: a.string("vm_name")?,
                snapshot_name: a.string("snapshot_name")?,
                remove_children: a.bool_or("remove_children", true)?,
                timeout_seconds: a.opt_seconds("timeout_seconds")?,
            },
            "revert_snapshot" => Self::RevertSnapshot {
                vm_name: a.string("vm_name")?,
                snapshot_name: a.string("snapshot_name")?,
                timeout_seconds: a.opt_seconds("timeout_seconds")?,
            },
            "list_snapshots" => Self::ListSnapshots { vm_name: a.string("vm_name")? },
            "remove_all_snapshots" => Self::RemoveAllSnapshots {
                vm_name: a.string("vm_name")?,
                timeout_seconds: a.opt_seconds("timeout_seconds")?,
            },
            "wait_for_updates" => Self::WaitForUpdates(WatchRequest {
                object_type: a.string("object_type")?,
                properties: a.strings("properties")?,
                max_wait_seconds: a.opt_u64("max_wait_seconds")?,
                max_iterations: a.opt_u32("max_iterations")?,
                objects: a.opt_strings("objects")?,
            }),
            "wait_for_task" => Self::WaitForTask {
                task_id: a.string("task_id")?,
                timeout_seconds: a.opt_seconds("timeout_seconds")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(call))
    }

    /// Run the call against the facade. `Authenticate` is answered by the
    /// session gate and never reaches here.
    pub async fn execute(self, service: &InfraService, cancel: &CancelFlag) -> OperationResult {
        match self {
            Self::Authenticate { .. } => OperationResult::precondition_failed("authenticate is handled by the session"),
            Self::CreateVm { name, cpu, memory_mb, datastore, network } => {
                service.create_vm(&name, cpu, memory_mb, datastore, network).await
            }
            Self::CreateVmCustom(request) => service.create_vm_custom(&request).await,
            Self::CloneVm { template_name, new_name } => service.clone_vm(&template_name, &new_name).await,
            Self::DeleteVm { name } => service.delete_vm(&name).await,
            Self::PowerOnVm { name } => service.power_on_vm(&name).await,
            Self::PowerOffVm { name } => service.power_off_vm(&name).await,
            Self::ListVms => service.list_vms().await,
            Self::ListTemplates => service.list_templates().await,
            Self::ListHosts => service.list_hosts().await,
            Self::ListNetworks => service.list_networks().await,
            Self::ListDatastores => service.list_datastores().await,
            Self::ListDatastoreClusters => service.list_datastore_clusters().await,
            Self::ListPerformanceCounters => service.list_performance_counters().await,
            Self::VmDetails { vm_name } => service.get_vm_details(&vm_name).await,
            Self::VmPerformance { vm_name } => service.get_vm_performance(&vm_name).await,
            Self::VmSummaryStats { vm_name } => service.get_vm_summary_stats(&vm_name).await,
            Self::HostDetails { host_name } => service.get_host_details(&host_name).await,
            Self::HostPerformanceMetrics { host_name } => service.get_host_performance_metrics(&host_name).await,
            Self::HostHardwareHealth { host_name } => service.get_host_hardware_health(&host_name).await,
            Self::HostPerformance { host_name } => service.get_host_performance(&host_name).await,
            Self::CreateSnapshot { vm_name, spec, timeout_seconds } => {
                service.create_snapshot(&vm_name, &spec, timeout_seconds).await
            }
            Self::RemoveSnapshot { vm_name, snapshot_name, remove_children, timeout_seconds } => {
                service.remove_snapshot(&vm_name, &snapshot_name, remove_children, timeout_seconds).await
            }
            Self::RevertSnapshot { vm_name, snapshot_name, timeout_seconds } => {
                service.revert_snapshot(&vm_name, &snapshot_name, timeout_seconds).await
            }
            Self::ListSnapshots { vm_name } => service.list_snapshots(&vm_name).await,
            Self::RemoveAllSnapshots { vm_name, timeout_seconds } => {
                service.remove_all_snapshots(&vm_name, timeout_seconds).await
            }
            Self::WaitForUpdates(request) => service.wait_for_updates(&request, cancel).await,
            Self::WaitForTask { task_id, timeout_seconds } => service.wait_for_task(&task_id, timeout_seconds).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn every_tool_in_the_table_decodes() {
        for spec in tool_table() {
            let required = spec.input_schema["required"].as_array().cloned().unwrap_or_default();
            let mut a = Map::new();
            for key in required {
                let key = key.as_str().unwrap().to_string();
                let value = match spec.input_schema["properties"][&key]["type"].as_str() {
                    Some("integer") => json!(1),
                    Some("array") => json!(["x"]),
                    _ => json!("x"),
                };
                a.insert(key, value);
            }
            assert!(ToolCall::parse(spec.name, &a).unwrap().is_some(), "{}", spec.name);
        }
    }

    #[test]
    fn snapshot_defaults_match_the_schema() {
        let call = ToolCall::parse("remove_snapshot", &args(json!({"vm_name": "web01", "snapshot_name": "s"})))
            .unwrap()
            .unwrap();
        assert_eq!(
            call,
            ToolCall::RemoveSnapshot {
                vm_name: "web01".into(),
                snapshot_name: "s".into(),
                remove_children: true,
                timeout_seconds: None,
            }
        );
    }

    #[test]
    fn custom_vm_defaults() {
        let call = ToolCall::parse("create_vm_custom", &args(json!({"name": "a", "cpu": 2, "memory": 2048})))
            .unwrap()
            .unwrap();
        match call {
            ToolCall::CreateVmCustom(r) => {
                assert_eq!(r.disk_size_gb, 10);
                assert_eq!(r.guest_id, "otherGuest");
                assert!(r.thin_provisioned);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_and_ill_typed_arguments_are_invalid_params() {
        let err = ToolCall::parse("create_vm", &args(json!({"name": "a", "cpu": 2}))).unwrap_err();
        assert_eq!(err.code, McpError::INVALID_PARAMS);
        assert!(err.message.contains("memory"));

        let err = ToolCall::parse("create_vm", &args(json!({"name": "a", "cpu": "two", "memory": 1}))).unwrap_err();
        assert_eq!(err.code, McpError::INVALID_PARAMS);

        let err = ToolCall::parse("wait_for_updates", &args(json!({"object_type": "VirtualMachine", "properties": [1]})))
            .unwrap_err();
        assert!(err.message.contains("array of strings"));
    }

    #[test]
    fn zero_timeout_is_invalid_params() {
        let err = ToolCall::parse("wait_for_task", &args(json!({"task_id": "task-7", "timeout_seconds": 0}))).unwrap_err();
        assert_eq!(err.code, McpError::INVALID_PARAMS);
        assert!(err.message.contains("timeout_seconds"));

        let err = ToolCall::parse("revert_snapshot", &args(json!({"vm_name": "web01", "snapshot_name": "s", "timeout_seconds": 0})))
            .unwrap_err();
        assert_eq!(err.code, McpError::INVALID_PARAMS);

        let call = ToolCall::parse("wait_for_task", &args(json!({"task_id": "task-7", "timeout_seconds": 1}))).unwrap();
        assert_eq!(call, Some(ToolCall::WaitForTask { task_id: "task-7".into(), timeout_seconds: Some(1) }));
    }

    #[test]
    fn snapshot_tools_carry_a_timeout() {
        let call = ToolCall::parse("remove_all_snapshots", &args(json!({"vm_name": "web01", "timeout_seconds": 45})))
            .unwrap()
            .unwrap();
        assert_eq!(call, ToolCall::RemoveAllSnapshots { vm_name: "web01".into(), timeout_seconds: Some(45) });
    }

    #[test]
    fn unknown_tool_is_not_an_error() {
        assert_eq!(ToolCall::parse("execute_program_in_vm", &Map::new()).unwrap(), None);
    }
}
