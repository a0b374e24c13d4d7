//! Shapes retrieved properties into the JSON documents returned to clients.
//!
//! Each report has a `*_PATHS` constant listing the properties it reads, so
//! the facade retrieves exactly what the shaper needs.

use crate::types::*;
use crate::xml::as_list;

use serde_json::{json, Value};
use std::collections::HashMap;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub const NET_TRANSMITTED: &str = "net.transmitted.average";
pub const NET_RECEIVED: &str = "net.received.average";

/// Ethernet card subtypes of `VirtualDevice`.
const ETHERNET_TYPES: &[&str] = &[
    "VirtualE1000",
    "VirtualE1000e",
    "VirtualPCNet32",
    "VirtualVmxnet",
    "VirtualVmxnet2",
    "VirtualVmxnet3",
    "VirtualVmxnet3Vrdma",
    "VirtualSriovEthernetCard",
];

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn gb(v: Option<&Value>) -> f64 {
    round2(v.and_then(Value::as_f64).unwrap_or(0.0) / GIB)
}

/// Walk into a retrieved property value.
fn field<'a>(p: &'a ObjectProperties, path: &str, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(p.get(path)?, |v, k| v.get(k))
}

fn or_null(v: Option<&Value>) -> Value {
    v.cloned().unwrap_or(Value::Null)
}

fn or_zero(v: Option<&Value>) -> Value {
    v.cloned().unwrap_or_else(|| json!(0))
}

// ── Virtual machines ────────────────────────────────────────────────

pub const VM_DETAIL_PATHS: &[&str] = &[
    "name",
    "runtime.powerState",
    "config.guestFullName",
    "config.hardware.numCPU",
    "config.hardware.memoryMB",
    "config.hardware.device",
    "config.uuid",
    "config.instanceUuid",
    "config.template",
    "config.annotation",
    "guest.ipAddress",
    "guest.toolsStatus",
    "guest.toolsVersion",
    "guest.hostName",
];

pub fn vm_details(p: &ObjectProperties) -> Value {
    let has_config = p.get("config.hardware.numCPU").is_some();
    let mut out = json!({
        "name": or_null(p.get("name")),
        "power_state": or_null(p.get("runtime.powerState")),
        "guest_os": p.get("config.guestFullName").cloned().unwrap_or_else(|| json!("Unknown")),
        "cpu_count": or_zero(p.get("config.hardware.numCPU")),
        "memory_mb": or_zero(p.get("config.hardware.memoryMB")),
        "uuid": or_null(p.get("config.uuid")),
        "instance_uuid": or_null(p.get("config.instanceUuid")),
        "ip_address": or_null(p.get("guest.ipAddress")),
        "tools_status": p.get("guest.toolsStatus").cloned().unwrap_or_else(|| json!("Unknown")),
        "tools_version": or_null(p.get("guest.toolsVersion")),
        "hostname": or_null(p.get("guest.hostName")),
        "template": p.get("config.template").cloned().unwrap_or(Value::Bool(false)),
        "annotation": p.get("config.annotation").cloned().unwrap_or_else(|| json!("")),
    });
    if !has_config {
        return out;
    }

    let devices = as_list(p.get("config.hardware.device"));
    let disks: Vec<Value> = devices
        .iter()
        .filter(|d| d["_type"] == "VirtualDisk")
        .map(|d| {
            json!({
                "label": or_null(d.pointer("/deviceInfo/label")),
                "capacity_gb": round2(d["capacityInKB"].as_f64().unwrap_or(0.0) / (1024.0 * 1024.0)),
                "disk_mode": or_null(d.pointer("/backing/diskMode")),
            })
        })
        .collect();
    let networks: Vec<Value> = devices
        .iter()
        .filter(|d| d["_type"].as_str().is_some_and(|t| ETHERNET_TYPES.contains(&t)))
        .map(|d| {
            let mut nic = json!({
                "label": or_null(d.pointer("/deviceInfo/label")),
                "mac_address": or_null(d.get("macAddress")),
                "connected": d.pointer("/connectable/connected").cloned().unwrap_or(Value::Bool(false)),
            });
            if let Some(name) = d.pointer("/backing/deviceName") {
                nic["network"] = name.clone();
            }
            nic
        })
        .collect();
    out["disks"] = Value::Array(disks);
    out["networks"] = Value::Array(networks);
    out
}

pub const VM_PERF_PATHS: &[&str] = &["name", "summary.quickStats", "summary.storage"];

/// `network` is the summed transmit / receive rate, `None` when the
/// counters could not be read.
pub fn vm_performance(p: &ObjectProperties, network: Option<(i64, i64)>) -> Value {
    let (tx, rx) = match network {
        Some((tx, rx)) => (json!(tx), json!(rx)),
        None => (Value::Null, Value::Null),
    };
    json!({
        "cpu_usage": or_null(field(p, "summary.quickStats", &["overallCpuUsage"])),
        "memory_usage": or_null(field(p, "summary.quickStats", &["guestMemoryUsage"])),
        "storage_usage": gb(field(p, "summary.storage", &["committed"])),
        "network_transmit_KBps": tx,
        "network_receive_KBps": rx,
    })
}

/// Ids of the network counters, in transmit / receive order.
pub fn network_counter_ids(counters: &[PerfCounterInfo]) -> (Option<i32>, Option<i32>) {
    let key = |name: &str| counters.iter().find(|c| c.full_name() == name).map(|c| c.key);
    (key(NET_TRANSMITTED), key(NET_RECEIVED))
}

/// Sum the latest samples of every instance per direction.
pub fn network_rates(ids: (Option<i32>, Option<i32>), series: &[PerfSeries]) -> (i64, i64) {
    let total = |id: Option<i32>| -> i64 {
        series
            .iter()
            .filter(|s| Some(s.counter_id) == id)
            .flat_map(|s| s.values.iter())
            .sum()
    };
    (total(ids.0), total(ids.1))
}

pub const VM_SUMMARY_PATHS: &[&str] = &["name", "runtime.powerState", "summary.quickStats", "summary.storage"];

pub fn vm_summary_stats(p: &ObjectProperties) -> Value {
    let qs = |k: &str| or_zero(field(p, "summary.quickStats", &[k]));
    json!({
        "name": or_null(p.get("name")),
        "power_state": or_null(p.get("runtime.powerState")),
        "overall_cpu_usage_mhz": qs("overallCpuUsage"),
        "overall_cpu_demand_mhz": qs("overallCpuDemand"),
        "guest_memory_usage_mb": qs("guestMemoryUsage"),
        "host_memory_usage_mb": qs("hostMemoryUsage"),
        "uptime_seconds": qs("uptimeSeconds"),
        "committed_storage_gb": gb(field(p, "summary.storage", &["committed"])),
        "uncommitted_storage_gb": gb(field(p, "summary.storage", &["uncommitted"])),
    })
}

pub const TEMPLATE_PATHS: &[&str] = &["name", "config.template"];

pub fn is_template(p: &ObjectProperties) -> bool {
    p.get("config.template").and_then(Value::as_bool).unwrap_or(false)
}

// ── Storage / network ───────────────────────────────────────────────

pub const DATASTORE_PATHS: &[&str] = &["name", "summary"];

pub fn datastore_info(p: &ObjectProperties) -> Value {
    let s = |k: &str| field(p, "summary", &[k]);
    json!({
        "name": or_null(p.get("name")),
        "type": or_null(s("type")),
        "capacity_gb": gb(s("capacity")),
        "free_space_gb": gb(s("freeSpace")),
        "accessible": or_null(s("accessible")),
        "maintenance_mode": s("maintenanceMode").cloned().unwrap_or_else(|| json!("normal")),
    })
}

pub const NETWORK_PATHS: &[&str] = &["name", "summary.accessible"];
pub const PORTGROUP_VLAN_PATHS: &[&str] = &["config.defaultPortConfig"];

pub fn is_portgroup(p: &ObjectProperties) -> bool {
    p.obj.kind == "DistributedVirtualPortgroup"
}

/// `portgroup_config` is the `config.defaultPortConfig` of a distributed
/// portgroup; ignored for standard networks.
pub fn network_info(p: &ObjectProperties, portgroup_config: Option<&ObjectProperties>) -> Value {
    let mut out = json!({
        "name": or_null(p.get("name")),
        "accessible": p.get("summary.accessible").cloned().unwrap_or(Value::Bool(true)),
    });
    if is_portgroup(p) {
        out["type"] = json!("DistributedVirtualPortgroup");
        out["vlan"] = or_null(portgroup_config.and_then(|c| field(c, "config.defaultPortConfig", &["vlan", "vlanId"])));
    } else {
        out["type"] = json!("Network");
    }
    out
}

pub const STORAGE_POD_PATHS: &[&str] = &["name", "summary", "childEntity"];

/// `datastore_names` maps datastore ids to names.
pub fn datastore_cluster_info(p: &ObjectProperties, datastore_names: &HashMap<String, String>) -> Value {
    let members: Vec<&str> = as_list(p.get("childEntity"))
        .into_iter()
        .filter(|c| c["type"] == "Datastore")
        .filter_map(|c| c["value"].as_str())
        .filter_map(|id| datastore_names.get(id).map(String::as_str))
        .collect();
    json!({
        "name": or_null(p.get("name")),
        "capacity_gb": gb(field(p, "summary", &["capacity"])),
        "free_space_gb": gb(field(p, "summary", &["freeSpace"])),
        "datastores": members,
    })
}

// ── Hosts ───────────────────────────────────────────────────────────

pub const HOST_DETAIL_PATHS: &[&str] = &[
    "name",
    "runtime.connectionState",
    "runtime.powerState",
    "runtime.standbyMode",
    "runtime.inMaintenanceMode",
    "hardware.systemInfo",
    "hardware.cpuInfo",
    "hardware.memorySize",
    "config.product",
];

fn cpu_mhz(p: &ObjectProperties) -> i64 {
    field(p, "hardware.cpuInfo", &["hz"]).and_then(Value::as_i64).unwrap_or(0) / 1_000_000
}

fn cpu_cores(p: &ObjectProperties) -> i64 {
    field(p, "hardware.cpuInfo", &["numCpuCores"]).and_then(Value::as_i64).unwrap_or(0)
}

pub fn host_details(p: &ObjectProperties) -> Value {
    let sys = |k: &str| or_null(field(p, "hardware.systemInfo", &[k]));
    let cpu = |k: &str| or_zero(field(p, "hardware.cpuInfo", &[k]));
    let product = |k: &str| or_null(field(p, "config.product", &[k]));
    json!({
        "name": or_null(p.get("name")),
        "connection_state": or_null(p.get("runtime.connectionState")),
        "power_state": or_null(p.get("runtime.powerState")),
        "standby_mode": or_null(p.get("runtime.standbyMode")),
        "in_maintenance_mode": or_null(p.get("runtime.inMaintenanceMode")),
        "vendor": sys("vendor"),
        "model": sys("model"),
        "uuid": sys("uuid"),
        "cpu_model": or_null(field(p, "hardware.cpuInfo", &["model"])),
        "cpu_cores": cpu("numCpuCores"),
        "cpu_threads": cpu("numCpuThreads"),
        "cpu_mhz": cpu_mhz(p),
        "memory_gb": gb(p.get("hardware.memorySize")),
        "hypervisor_version": product("version"),
        "hypervisor_build": product("build"),
    })
}

pub const HOST_METRIC_PATHS: &[&str] = &["summary.quickStats"];

pub fn host_metrics(p: &ObjectProperties) -> Value {
    let qs = |k: &str| or_zero(field(p, "summary.quickStats", &[k]));
    json!({
        "cpu_usage_mhz": qs("overallCpuUsage"),
        "memory_usage_mb": qs("overallMemoryUsage"),
        "uptime_seconds": qs("uptime"),
    })
}

pub const HOST_PERF_PATHS: &[&str] = &["summary.quickStats", "hardware.cpuInfo", "hardware.memorySize"];

/// Quick stats plus utilisation against the hardware totals.
pub fn host_performance(p: &ObjectProperties) -> Value {
    let mut out = host_metrics(p);
    if p.get("hardware.cpuInfo").is_none() && p.get("hardware.memorySize").is_none() {
        return out;
    }
    let total_cpu = cpu_cores(p) * cpu_mhz(p);
    let total_mem = p.get("hardware.memorySize").and_then(Value::as_i64).unwrap_or(0) / (1024 * 1024);
    let used_cpu = out["cpu_usage_mhz"].as_f64().unwrap_or(0.0);
    let used_mem = out["memory_usage_mb"].as_f64().unwrap_or(0.0);
    let percent = |used: f64, total: i64| if total > 0 { round2(used / total as f64 * 100.0) } else { 0.0 };

    out["cpu_total_mhz"] = json!(total_cpu);
    out["cpu_usage_percent"] = json!(percent(used_cpu, total_cpu));
    out["memory_total_mb"] = json!(total_mem);
    out["memory_usage_percent"] = json!(percent(used_mem, total_mem));
    out
}

pub const HOST_HEALTH_PATHS: &[&str] = &["overallStatus", "runtime.healthSystemRuntime.systemHealthInfo"];

pub fn host_hardware_health(p: &ObjectProperties) -> Value {
    let sensors: Vec<Value> = as_list(field(
        p,
        "runtime.healthSystemRuntime.systemHealthInfo",
        &["numericSensorInfo"],
    ))
    .into_iter()
    .map(|s| {
        json!({
            "name": or_null(s.get("name")),
            "health_state": or_null(s.pointer("/healthState/label").or_else(|| s.pointer("/healthState/key"))),
            "current_reading": or_null(s.get("currentReading")),
            "unit": or_null(s.get("unitModifier")),
            "sensor_type": or_null(s.get("sensorType")),
        })
    })
    .collect();
    json!({
        "overall_status": or_null(p.get("overallStatus")),
        "hardware_status": sensors,
    })
}

/// Names of retrieved objects, in retrieval order.
pub fn names(found: &[ObjectProperties]) -> Vec<String> {
    found.iter().filter_map(|p| p.str("name")).map(str::to_string).collect()
}

/// Id to name map of retrieved objects.
pub fn name_index(found: &[ObjectProperties]) -> HashMap<String, String> {
    found
        .iter()
        .filter_map(|p| Some((p.obj.value.clone(), p.str("name")?.to_string())))
        .collect()
}
