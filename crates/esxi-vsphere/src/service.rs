//! Aggregate service facade.
//!
//! `InfraService` owns the remote endpoint, the task waiter and the
//! placement defaults resolved at connect time, and exposes every
//! operation the protocol layer dispatches to. Each operation returns an
//! [`OperationResult`]; nothing above this layer sees a raw remote error.

use crate::api::ManagementApi;
use crate::error::{VsphereError, VsphereResult};
use crate::outcome::{OperationResult, OutcomeKind};
use crate::reports;
use crate::snapshot::SnapshotNavigator;
use crate::task::TaskWaiter;
use crate::types::*;
use crate::watcher::{CancelFlag, ChangeWatcher};
use crate::xml::as_list;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Return early with the error converted to an [`OperationResult`].
macro_rules! attempt {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return OperationResult::from(e),
        }
    };
}

/// Configured names for the placement of new VMs. Unset entries fall back
/// to the first datacenter / compute resource, the datastore with the most
/// free space and no network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementDefaults {
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub datastore: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

/// Placement resolved against the live inventory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub datacenter: ObjectRef,
    pub vm_folder: ObjectRef,
    pub resource_pool: ObjectRef,
    pub datastore: ObjectRef,
    pub network: Option<ObjectRef>,
    /// Datastore and network ids belonging to the datacenter.
    #[serde(skip)]
    datastore_ids: Vec<String>,
    #[serde(skip)]
    network_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomVmRequest {
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
    pub guest_id: String,
    pub datastore: Option<String>,
    pub network: Option<String>,
    pub thin_provisioned: bool,
    pub annotation: Option<String>,
}

impl CustomVmRequest {
    pub const DEFAULT_DISK_SIZE_GB: u64 = 10;
    pub const DEFAULT_GUEST_ID: &'static str = "otherGuest";

    pub fn new(name: impl Into<String>, cpu: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            cpu,
            memory_mb,
            disk_size_gb: Self::DEFAULT_DISK_SIZE_GB,
            guest_id: Self::DEFAULT_GUEST_ID.to_string(),
            datastore: None,
            network: None,
            thin_provisioned: true,
            annotation: None,
        }
    }
}

/// Arguments of a watch request.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRequest {
    pub object_type: String,
    pub properties: Vec<String>,
    pub max_wait_seconds: Option<u64>,
    pub max_iterations: Option<u32>,
    /// Names to narrow the watch to; every object of the type otherwise.
    pub objects: Option<Vec<String>>,
}

pub struct InfraService {
    api: Arc<dyn ManagementApi>,
    coordination: CoordinationConfig,
    waiter: TaskWaiter,
    placement: Placement,
}

impl InfraService {
    /// Resolve placement defaults and build the facade.
    pub async fn connect(
        api: Arc<dyn ManagementApi>,
        coordination: CoordinationConfig,
        defaults: &PlacementDefaults,
    ) -> VsphereResult<Self> {
        let placement = resolve_placement(&*api, defaults).await?;
        log::info!(
            "Placement: datacenter {}, pool {}, datastore {}, network {}",
            placement.datacenter.label(),
            placement.resource_pool.value,
            placement.datastore.label(),
            placement.network.as_ref().map_or("none", |n| n.label())
        );
        Ok(Self {
            api,
            waiter: TaskWaiter::new(coordination.clone()),
            coordination,
            placement,
        })
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn coordination(&self) -> &CoordinationConfig {
        &self.coordination
    }

    /// `timeout_secs` bounds each task the navigator waits on.
    fn snapshots(&self, timeout_secs: Option<u64>) -> SnapshotNavigator<'_, dyn ManagementApi> {
        SnapshotNavigator::new(&*self.api, &self.waiter).with_timeout(timeout_secs)
    }

    async fn lookup(&self, kind: ObjectKind, label: &str, name: &str) -> Result<ObjectRef, OperationResult> {
        match self.api.resolve(kind, name).await {
            Ok(Some(obj)) => Ok(obj),
            Ok(None) => Err(OperationResult::not_found(format!("{label} '{name}' not found"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn vm(&self, name: &str) -> Result<ObjectRef, OperationResult> {
        self.lookup(ObjectKind::VirtualMachine, "VM", name).await
    }

    async fn host(&self, name: &str) -> Result<ObjectRef, OperationResult> {
        self.lookup(ObjectKind::HostSystem, "Host", name).await
    }

    async fn run(&self, submitted: VsphereResult<Submitted>) -> OperationResult {
        match submitted {
            Ok(s) => self.waiter.complete(&*self.api, s, None).await,
            Err(e) => e.into(),
        }
    }

    // ── Listings ────────────────────────────────────────────────────

    pub async fn list_vms(&self) -> OperationResult {
        let vms = attempt!(self.api.list_vms().await);
        let names: Vec<String> = vms.into_iter().map(|v| v.name).collect();
        OperationResult::ok(format!("{} VMs", names.len())).with_payload(json!(names))
    }

    pub async fn list_templates(&self) -> OperationResult {
        let found = attempt!(self.api.retrieve_by_kind(ObjectKind::VirtualMachine, reports::TEMPLATE_PATHS).await);
        let templates: Vec<ObjectProperties> = found.into_iter().filter(reports::is_template).collect();
        let names = reports::names(&templates);
        OperationResult::ok(format!("{} templates", names.len())).with_payload(json!(names))
    }

    pub async fn list_hosts(&self) -> OperationResult {
        let hosts = attempt!(self.api.list_hosts().await);
        let names: Vec<String> = hosts.into_iter().map(|h| h.name).collect();
        OperationResult::ok(format!("{} hosts", names.len())).with_payload(json!(names))
    }

    pub async fn list_datastores(&self) -> OperationResult {
        let found = attempt!(self.api.retrieve_by_kind(ObjectKind::Datastore, reports::DATASTORE_PATHS).await);
        let rows: Vec<Value> = found.iter().map(reports::datastore_info).collect();
        OperationResult::ok(format!("{} datastores", rows.len())).with_payload(json!(rows))
    }

    /// Distributed port groups report their VLAN; a failed VLAN lookup
    /// leaves it null.
    pub async fn list_networks(&self) -> OperationResult {
        let found = attempt!(self.api.retrieve_by_kind(ObjectKind::Network, reports::NETWORK_PATHS).await);
        let mut rows = Vec::with_capacity(found.len());
        for net in &found {
            let config = if reports::is_portgroup(net) {
                match self.api.retrieve_properties(&net.obj, reports::PORTGROUP_VLAN_PATHS).await {
                    Ok(c) => Some(c),
                    Err(e) => {
                        log::warn!("Could not read VLAN of port group {}: {e}", net.obj.value);
                        None
                    }
                }
            } else {
                None
            };
            rows.push(reports::network_info(net, config.as_ref()));
        }
        OperationResult::ok(format!("{} networks", rows.len())).with_payload(json!(rows))
    }

    pub async fn list_datastore_clusters(&self) -> OperationResult {
        let pods = attempt!(self.api.retrieve_by_kind(ObjectKind::StoragePod, reports::STORAGE_POD_PATHS).await);
        let datastores = attempt!(self.api.retrieve_by_kind(ObjectKind::Datastore, &["name"]).await);
        let index = reports::name_index(&datastores);
        let rows: Vec<Value> = pods.iter().map(|p| reports::datastore_cluster_info(p, &index)).collect();
        OperationResult::ok(format!("{} datastore clusters", rows.len())).with_payload(json!(rows))
    }

    pub async fn list_performance_counters(&self) -> OperationResult {
        let counters = attempt!(self.api.perf_counters().await);
        OperationResult::ok(format!("{} performance counters", counters.len())).with_payload(json!(counters))
    }

    // ── VM reports ──────────────────────────────────────────────────

    pub async fn get_vm_details(&self, name: &str) -> OperationResult {
        let vm = attempt!(self.vm(name).await);
        let p = attempt!(self.api.retrieve_properties(&vm, reports::VM_DETAIL_PATHS).await);
        OperationResult::ok(format!("Details of VM '{name}'")).with_payload(reports::vm_details(&p))
    }

    /// Quick stats plus network counters. Counter failures are logged and
    /// reported as null rates.
    pub async fn get_vm_performance(&self, name: &str) -> OperationResult {
        let vm = attempt!(self.vm(name).await);
        let p = attempt!(self.api.retrieve_properties(&vm, reports::VM_PERF_PATHS).await);
        let network = match self.network_rates(&vm).await {
            Ok(rates) => Some(rates),
            Err(e) => {
                log::warn!("Failed to retrieve network performance data for VM '{name}': {e}");
                None
            }
        };
        OperationResult::ok(format!("Performance of VM '{name}'")).with_payload(reports::vm_performance(&p, network))
    }

    async fn network_rates(&self, vm: &ObjectRef) -> VsphereResult<(i64, i64)> {
        let counters = self.api.perf_counters().await?;
        let ids = reports::network_counter_ids(&counters);
        let wanted: Vec<i32> = [ids.0, ids.1].into_iter().flatten().collect();
        if wanted.is_empty() {
            return Ok((0, 0));
        }
        let series = self.api.query_perf(vm, &wanted).await?;
        Ok(reports::network_rates(ids, &series))
    }

    pub async fn get_vm_summary_stats(&self, name: &str) -> OperationResult {
        let vm = attempt!(self.vm(name).await);
        let p = attempt!(self.api.retrieve_properties(&vm, reports::VM_SUMMARY_PATHS).await);
        OperationResult::ok(format!("Summary statistics of VM '{name}'")).with_payload(reports::vm_summary_stats(&p))
    }

    // ── Host reports ────────────────────────────────────────────────

    pub async fn get_host_details(&self, name: &str) -> OperationResult {
        let host = attempt!(self.host(name).await);
        let p = attempt!(self.api.retrieve_properties(&host, reports::HOST_DETAIL_PATHS).await);
        OperationResult::ok(format!("Details of host '{name}'")).with_payload(reports::host_details(&p))
    }

    pub async fn get_host_performance_metrics(&self, name: &str) -> OperationResult {
        let host = attempt!(self.host(name).await);
        let p = attempt!(self.api.retrieve_properties(&host, reports::HOST_METRIC_PATHS).await);
        OperationResult::ok(format!("Metrics of host '{name}'")).with_payload(reports::host_metrics(&p))
    }

    pub async fn get_host_hardware_health(&self, name: &str) -> OperationResult {
        let host = attempt!(self.host(name).await);
        let p = attempt!(self.api.retrieve_properties(&host, reports::HOST_HEALTH_PATHS).await);
        OperationResult::ok(format!("Hardware health of host '{name}'")).with_payload(reports::host_hardware_health(&p))
    }

    pub async fn get_host_performance(&self, name: &str) -> OperationResult {
        let host = attempt!(self.host(name).await);
        let p = attempt!(self.api.retrieve_properties(&host, reports::HOST_PERF_PATHS).await);
        OperationResult::ok(format!("Performance of host '{name}'")).with_payload(reports::host_performance(&p))
    }

    // ── VM lifecycle ────────────────────────────────────────────────

    /// 10 GB thin disk, `otherGuest`.
    pub async fn create_vm(
        &self,
        name: &str,
        cpu: u32,
        memory_mb: u64,
        datastore: Option<String>,
        network: Option<String>,
    ) -> OperationResult {
        let request = CustomVmRequest { datastore, network, ..CustomVmRequest::new(name, cpu, memory_mb) };
        self.create(&request).await.on_success(format!("VM '{name}' created."))
    }

    pub async fn create_vm_custom(&self, request: &CustomVmRequest) -> OperationResult {
        self.create(request).await.on_success(format!(
            "Custom VM '{}' created with {} CPUs, {}MB RAM, and {}GB disk.",
            request.name, request.cpu, request.memory_mb, request.disk_size_gb
        ))
    }

    async fn create(&self, request: &CustomVmRequest) -> OperationResult {
        let datastore = match &request.datastore {
            Some(name) => attempt!(self.placement_target(ObjectKind::Datastore, "Datastore", name).await),
            None => self.placement.datastore.clone(),
        };
        let network = match &request.network {
            Some(name) => Some(attempt!(self.placement_target(ObjectKind::Network, "Network", name).await)),
            None => self.placement.network.clone(),
        };
        let spec = VmCreateSpec {
            name: request.name.clone(),
            cpu_count: request.cpu,
            memory_mb: request.memory_mb,
            disk_size_gb: request.disk_size_gb,
            guest_id: request.guest_id.clone(),
            thin_provisioned: request.thin_provisioned,
            annotation: request.annotation.clone(),
            placement: VmPlacement {
                folder: self.placement.vm_folder.clone(),
                resource_pool: self.placement.resource_pool.clone(),
                datastore,
                network,
            },
        };
        log::info!("Creating VM '{}' ({} CPUs, {} MB, {} GB disk)", spec.name, spec.cpu_count, spec.memory_mb, spec.disk_size_gb);
        self.run(self.api.create_vm(&spec).await).await
    }

    /// Datastore or network override, which must belong to the placement
    /// datacenter.
    async fn placement_target(&self, kind: ObjectKind, label: &str, name: &str) -> Result<ObjectRef, OperationResult> {
        let not_found = || OperationResult::not_found(format!("Specified {} '{name}' not found", label.to_lowercase()));
        let obj = self
            .lookup(kind, label, name)
            .await
            .map_err(|r| if r.kind == OutcomeKind::NotFound { not_found() } else { r })?;
        let scope = match kind {
            ObjectKind::Datastore => &self.placement.datastore_ids,
            _ => &self.placement.network_ids,
        };
        if scope.contains(&obj.value) {
            Ok(obj)
        } else {
            Err(not_found())
        }
    }

    /// Clone into the template's folder and pool, falling back to the
    /// datacenter VM folder and the default pool.
    pub async fn clone_vm(&self, template_name: &str, new_name: &str) -> OperationResult {
        let template = attempt!(self.lookup(ObjectKind::VirtualMachine, "Template", template_name).await);
        let p = attempt!(self.api.retrieve_properties(&template, &["parent", "resourcePool"]).await);
        let folder = moref_prop(&p, "parent")
            .filter(|f| f.kind == "Folder")
            .unwrap_or_else(|| self.placement.vm_folder.clone());
        let resource_pool = moref_prop(&p, "resourcePool").unwrap_or_else(|| self.placement.resource_pool.clone());
        let spec = VmCloneSpec {
            source: template,
            name: new_name.to_string(),
            folder,
            resource_pool,
            datastore: self.placement.datastore.clone(),
            power_on: false,
        };
        self.run(self.api.clone_vm(&spec).await)
            .await
            .on_success(format!("VM '{new_name}' cloned from '{template_name}'."))
    }

    pub async fn delete_vm(&self, name: &str) -> OperationResult {
        let vm = attempt!(self.vm(name).await);
        self.run(self.api.destroy_vm(&vm).await).await.on_success(format!("VM '{name}' deleted."))
    }

    pub async fn power_on_vm(&self, name: &str) -> OperationResult {
        let vm = attempt!(self.vm(name).await);
        if attempt!(self.power_state(&vm).await) == VmPowerState::PoweredOn {
            return OperationResult::ok(format!("VM '{name}' is already powered on."));
        }
        self.run(self.api.power_on_vm(&vm).await).await.on_success(format!("VM '{name}' powered on."))
    }

    pub async fn power_off_vm(&self, name: &str) -> OperationResult {
        let vm = attempt!(self.vm(name).await);
        if attempt!(self.power_state(&vm).await) == VmPowerState::PoweredOff {
            return OperationResult::ok(format!("VM '{name}' is already powered off."));
        }
        self.run(self.api.power_off_vm(&vm).await).await.on_success(format!("VM '{name}' powered off."))
    }

    async fn power_state(&self, vm: &ObjectRef) -> VsphereResult<VmPowerState> {
        let p = self.api.retrieve_properties(vm, &["runtime.powerState"]).await?;
        Ok(p.str("runtime.powerState").map(VmPowerState::from_vim).unwrap_or_default())
    }

    // ── Snapshots ───────────────────────────────────────────────────

    // Snapshot mutations take an optional per-task timeout; `None` keeps the
    // configured default.

    pub async fn create_snapshot(
        &self,
        vm_name: &str,
        spec: &CreateSnapshotSpec,
        timeout_secs: Option<u64>,
    ) -> OperationResult {
        let vm = attempt!(self.vm(vm_name).await);
        self.snapshots(timeout_secs).create(&vm, spec).await
    }

    pub async fn remove_snapshot(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        remove_children: bool,
        timeout_secs: Option<u64>,
    ) -> OperationResult {
        let vm = attempt!(self.vm(vm_name).await);
        self.snapshots(timeout_secs).remove(&vm, snapshot_name, remove_children).await
    }

    pub async fn revert_snapshot(&self, vm_name: &str, snapshot_name: &str, timeout_secs: Option<u64>) -> OperationResult {
        let vm = attempt!(self.vm(vm_name).await);
        self.snapshots(timeout_secs).revert(&vm, snapshot_name).await
    }

    pub async fn list_snapshots(&self, vm_name: &str) -> OperationResult {
        let vm = attempt!(self.vm(vm_name).await);
        let entries = attempt!(self.snapshots(None).list_all(&vm).await);
        OperationResult::ok(format!("{} snapshots on VM '{vm_name}'", entries.len())).with_payload(json!(entries))
    }

    pub async fn remove_all_snapshots(&self, vm_name: &str, timeout_secs: Option<u64>) -> OperationResult {
        let vm = attempt!(self.vm(vm_name).await);
        self.snapshots(timeout_secs).remove_all(&vm).await
    }

    // ── Coordination ────────────────────────────────────────────────

    pub async fn wait_for_updates(&self, request: &WatchRequest, cancel: &CancelFlag) -> OperationResult {
        let kind: ObjectKind = match request.object_type.parse() {
            Ok(k) => k,
            Err(msg) => return OperationResult::not_found(msg),
        };
        if request.properties.is_empty() {
            return OperationResult::precondition_failed("At least one property to watch is required");
        }
        let targets = match &request.objects {
            Some(names) if !names.is_empty() => {
                let mut objs = Vec::with_capacity(names.len());
                for name in names {
                    objs.push(attempt!(self.lookup(kind, kind.as_str(), name).await));
                }
                WatchTargets::Objects(objs)
            }
            _ => WatchTargets::Kind(kind),
        };
        let spec = WatchSpec { targets, properties: request.properties.clone() };
        ChangeWatcher::new(&*self.api, &self.coordination)
            .watch(&spec, request.max_iterations, request.max_wait_seconds, cancel)
            .await
            .into_result()
    }

    pub async fn wait_for_task(&self, task_id: &str, timeout_secs: Option<u64>) -> OperationResult {
        self.waiter.wait(&*self.api, &TaskRef::new(task_id), timeout_secs).await
    }
}

fn moref_prop(p: &ObjectProperties, path: &str) -> Option<ObjectRef> {
    p.get(path).cloned().and_then(|v| serde_json::from_value(v).ok())
}

fn morefs(v: Option<&Value>) -> Vec<ObjectRef> {
    as_list(v).into_iter().filter_map(|m| serde_json::from_value(m.clone()).ok()).collect()
}

// ── Placement ───────────────────────────────────────────────────────

async fn resolve_placement<A: ManagementApi + ?Sized>(api: &A, defaults: &PlacementDefaults) -> VsphereResult<Placement> {
    let dcs = api
        .retrieve_by_kind(ObjectKind::Datacenter, &["name", "vmFolder", "hostFolder", "datastore", "network"])
        .await?;
    let dc = match &defaults.datacenter {
        Some(name) => dcs
            .into_iter()
            .find(|d| d.str("name") == Some(name.as_str()))
            .ok_or_else(|| VsphereError::not_found(format!("Datacenter {name} not found")))?,
        None => dcs
            .into_iter()
            .next()
            .ok_or_else(|| VsphereError::not_found("No datacenter object found"))?,
    };
    let datacenter = ObjectRef { name: dc.str("name").map(str::to_string), ..dc.obj.clone() };
    let vm_folder = moref_prop(&dc, "vmFolder")
        .ok_or_else(|| VsphereError::parse(format!("Datacenter {} has no VM folder", datacenter.label())))?;
    let host_folder = moref_prop(&dc, "hostFolder");

    // Compute resources directly under the datacenter's host folder.
    let computes = api
        .retrieve_by_kind(ObjectKind::ComputeResource, &["name", "parent", "resourcePool"])
        .await?;
    let mut in_dc = computes
        .into_iter()
        .filter(|c| host_folder.as_ref().is_some_and(|hf| moref_prop(c, "parent").is_some_and(|p| p.same_object(hf))));
    let compute = match &defaults.cluster {
        Some(name) => in_dc
            .find(|c| c.obj.kind == "ClusterComputeResource" && c.str("name") == Some(name.as_str()))
            .ok_or_else(|| VsphereError::not_found(format!("Cluster {name} not found")))?,
        None => in_dc
            .next()
            .ok_or_else(|| VsphereError::not_found("No compute resource (cluster or host) found"))?,
    };
    let resource_pool = moref_prop(&compute, "resourcePool")
        .ok_or_else(|| VsphereError::parse(format!("Compute resource {} has no resource pool", compute.obj.value)))?;

    let datastore_ids: Vec<String> = morefs(dc.get("datastore")).into_iter().map(|d| d.value).collect();
    let datastores: Vec<ObjectProperties> = api
        .retrieve_by_kind(ObjectKind::Datastore, &["name", "summary.freeSpace"])
        .await?
        .into_iter()
        .filter(|d| datastore_ids.contains(&d.obj.value))
        .collect();
    let free = |d: &ObjectProperties| d.get("summary.freeSpace").and_then(Value::as_i64).unwrap_or(0);
    let chosen = match &defaults.datastore {
        Some(name) => datastores
            .iter()
            .find(|d| d.str("name") == Some(name.as_str()))
            .ok_or_else(|| VsphereError::not_found(format!("Datastore {name} not found")))?,
        None => datastores
            .iter()
            .max_by_key(|d| free(*d))
            .ok_or_else(|| VsphereError::not_found("No available datastore found in the datacenter"))?,
    };
    let datastore = ObjectRef { name: chosen.str("name").map(str::to_string), ..chosen.obj.clone() };

    let network_ids: Vec<String> = morefs(dc.get("network")).into_iter().map(|n| n.value).collect();
    let network = match &defaults.network {
        Some(name) => {
            let found = api
                .retrieve_by_kind(ObjectKind::Network, &["name"])
                .await?
                .into_iter()
                .find(|n| network_ids.contains(&n.obj.value) && n.str("name") == Some(name.as_str()))
                .ok_or_else(|| VsphereError::not_found(format!("Network {name} not found")))?;
            Some(ObjectRef { name: Some(name.clone()), ..found.obj })
        }
        None => None,
    };

    Ok(Placement { datacenter, vm_folder, resource_pool, datastore, network, datastore_ids, network_ids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OutcomeKind;
    use crate::testing::{snap, FakeHypervisor};

    /// One datacenter, one cluster, two datastores, one network, one VM and
    /// one template.
    fn lab() -> Arc<FakeHypervisor> {
        let fake = FakeHypervisor::new();
        fake.add_object(ObjectKind::Datacenter, "Datacenter", "datacenter-1", "DC1");
        fake.set_property("datacenter-1", "vmFolder", json!({"type": "Folder", "value": "group-v1"}));
        fake.set_property("datacenter-1", "hostFolder", json!({"type": "Folder", "value": "group-h1"}));
        fake.set_property(
            "datacenter-1",
            "datastore",
            json!([{"type": "Datastore", "value": "datastore-1"}, {"type": "Datastore", "value": "datastore-2"}]),
        );
        fake.set_property("datacenter-1", "network", json!([{"type": "Network", "value": "network-1"}]));

        fake.add_object(ObjectKind::ComputeResource, "ClusterComputeResource", "domain-c1", "Cluster1");
        fake.set_property("domain-c1", "parent", json!({"type": "Folder", "value": "group-h1"}));
        fake.set_property("domain-c1", "resourcePool", json!({"type": "ResourcePool", "value": "resgroup-1"}));

        fake.add_object(ObjectKind::Datastore, "Datastore", "datastore-1", "small");
        fake.set_property("datastore-1", "summary.freeSpace", json!(1_000_i64));
        fake.add_object(ObjectKind::Datastore, "Datastore", "datastore-2", "big");
        fake.set_property("datastore-2", "summary.freeSpace", json!(9_000_i64));
        fake.add_object(ObjectKind::Datastore, "Datastore", "datastore-9", "elsewhere");
        fake.add_object(ObjectKind::Network, "Network", "network-1", "VM Network");

        fake.add_vm("vm-1", "web01", "poweredOff");
        fake.add_vm("vm-2", "tmpl-ubuntu", "poweredOff");
        fake.set_property("vm-2", "config.template", json!(true));
        fake.set_property("vm-2", "parent", json!({"type": "Folder", "value": "group-v7"}));
        fake.set_property("vm-2", "resourcePool", json!({"type": "ResourcePool", "value": "resgroup-7"}));
        Arc::new(fake)
    }

    async fn service(fake: &Arc<FakeHypervisor>, defaults: PlacementDefaults) -> InfraService {
        InfraService::connect(fake.clone(), CoordinationConfig::default(), &defaults).await.unwrap()
    }

    #[tokio::test]
    async fn placement_picks_datastore_with_most_free_space() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;
        let p = svc.placement();
        assert_eq!(p.datacenter.label(), "DC1");
        assert_eq!(p.vm_folder.value, "group-v1");
        assert_eq!(p.resource_pool.value, "resgroup-1");
        assert_eq!(p.datastore.label(), "big");
        assert!(p.network.is_none());
    }

    #[tokio::test]
    async fn placement_honours_configured_names() {
        let fake = lab();
        let defaults = PlacementDefaults {
            datastore: Some("small".into()),
            network: Some("VM Network".into()),
            cluster: Some("Cluster1".into()),
            ..PlacementDefaults::default()
        };
        let svc = service(&fake, defaults).await;
        assert_eq!(svc.placement().datastore.label(), "small");
        assert_eq!(svc.placement().network.as_ref().map(|n| n.value.as_str()), Some("network-1"));
    }

    #[tokio::test]
    async fn unknown_configured_datacenter_fails_startup() {
        let fake = lab();
        let defaults = PlacementDefaults { datacenter: Some("DC9".into()), ..PlacementDefaults::default() };
        let err = InfraService::connect(fake.clone(), CoordinationConfig::default(), &defaults).await.err().unwrap();
        assert_eq!(err.message, "Datacenter DC9 not found");
    }

    #[tokio::test]
    async fn create_vm_uses_placement_and_reports_original_wording() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.create_vm("db01", 2, 4096, None, None).await;
        assert_eq!(result.message, "VM 'db01' created.");
        assert_eq!(
            fake.calls_matching("create_vm"),
            ["create_vm(db01, cpu=2, mem=4096, disk=10, ds=datastore-2, net=-)"]
        );
    }

    #[tokio::test]
    async fn create_vm_rejects_datastore_outside_datacenter() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.create_vm("db01", 2, 4096, Some("elsewhere".into()), None).await;
        assert_eq!(result.kind, OutcomeKind::NotFound);
        assert_eq!(result.message, "Specified datastore 'elsewhere' not found");
        assert!(fake.calls_matching("create_vm").is_empty());
    }

    #[tokio::test]
    async fn create_vm_keeps_lookup_failure_of_override() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;
        fake.fail_resolve("big", VsphereError::api(503, "API error 503: service unavailable"));

        let result = svc.create_vm("db01", 2, 4096, Some("big".into()), None).await;
        assert_eq!(result.kind, OutcomeKind::RemoteError);
        assert_eq!(result.message, "API error 503: service unavailable");
        assert!(fake.calls_matching("create_vm").is_empty());

        fake.fail_resolve("VM Network", VsphereError::timeout("lookup timed out"));
        let result = svc.create_vm("db01", 2, 4096, None, Some("VM Network".into())).await;
        assert_eq!(result.kind, OutcomeKind::Timeout);
    }

    #[tokio::test]
    async fn create_vm_custom_message() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;
        let request = CustomVmRequest { disk_size_gb: 40, network: Some("VM Network".into()), ..CustomVmRequest::new("app01", 4, 8192) };

        let result = svc.create_vm_custom(&request).await;
        assert_eq!(result.message, "Custom VM 'app01' created with 4 CPUs, 8192MB RAM, and 40GB disk.");
        assert!(fake.calls_matching("create_vm")[0].ends_with("disk=40, ds=datastore-2, net=network-1)"));
    }

    #[tokio::test]
    async fn clone_places_next_to_template() {
        let fake = lab();
        fake.task_result_for("vm-2", json!({"type": "VirtualMachine", "value": "vm-3"}));
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.clone_vm("tmpl-ubuntu", "web02").await;
        assert_eq!(result.message, "VM 'web02' cloned from 'tmpl-ubuntu'.");
        assert_eq!(result.payload, Some(json!({"type": "VirtualMachine", "value": "vm-3"})));
        assert_eq!(
            fake.calls_matching("clone_vm"),
            ["clone_vm(vm-2 -> web02, folder=group-v7, pool=resgroup-7)"]
        );
    }

    #[tokio::test]
    async fn power_on_is_idempotent() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;

        assert_eq!(svc.power_on_vm("web01").await.message, "VM 'web01' powered on.");
        assert_eq!(svc.power_on_vm("web01").await.message, "VM 'web01' is already powered on.");
        assert_eq!(fake.calls_matching("power_on_vm").len(), 1);
        assert_eq!(svc.power_off_vm("web01").await.message, "VM 'web01' powered off.");
    }

    #[tokio::test]
    async fn unknown_vm_is_not_found() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.delete_vm("ghost").await;
        assert_eq!(result.kind, OutcomeKind::NotFound);
        assert_eq!(result.message, "VM 'ghost' not found");
    }

    #[tokio::test]
    async fn failed_delete_keeps_remote_message() {
        let fake = lab();
        fake.fail_tasks_on("vm-1", "The attempted operation cannot be performed in the current state (Powered on).");
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.delete_vm("web01").await;
        assert_eq!(result.kind, OutcomeKind::RemoteError);
        assert_eq!(result.message, "The attempted operation cannot be performed in the current state (Powered on).");
    }

    #[tokio::test]
    async fn hosts_are_listed_by_name() {
        let fake = lab();
        fake.add_host("host-10", "esx01.lab");
        fake.add_host("host-11", "esx02.lab");
        let svc = service(&fake, PlacementDefaults::default()).await;

        assert_eq!(svc.list_hosts().await.payload, Some(json!(["esx01.lab", "esx02.lab"])));
    }

    #[tokio::test]
    async fn templates_are_filtered_from_vms() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;

        assert_eq!(svc.list_templates().await.payload, Some(json!(["tmpl-ubuntu"])));
        assert_eq!(svc.list_vms().await.payload, Some(json!(["web01", "tmpl-ubuntu"])));
    }

    #[tokio::test]
    async fn vm_performance_tolerates_counter_failure() {
        let fake = lab();
        fake.set_property("vm-1", "summary.quickStats", json!({"overallCpuUsage": 50, "guestMemoryUsage": 256}));
        fake.fail_perf(VsphereError::fault("Performance statistics unavailable"));
        fake.set_perf(
            vec![PerfCounterInfo {
                key: 1,
                group: "net".into(),
                name: "transmitted".into(),
                rollup_type: "average".into(),
                stats_type: "rate".into(),
                unit: "kiloBytesPerSecond".into(),
                description: String::new(),
            }],
            Vec::new(),
        );
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.get_vm_performance("web01").await;
        assert!(result.is_ok());
        let payload = result.payload.unwrap();
        assert_eq!(payload["cpu_usage"], 50);
        assert!(payload["network_transmit_KBps"].is_null());
    }

    #[tokio::test]
    async fn snapshot_listing_goes_through_the_navigator() {
        let fake = lab();
        fake.set_forest("vm-1", vec![snap("s1", "base", vec![snap("s2", "patched", vec![])])]);
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.list_snapshots("web01").await;
        let payload = result.payload.unwrap();
        assert_eq!(payload[1]["name"], "patched");
        assert_eq!(payload[1]["level"], 1);
        assert_eq!(svc.remove_all_snapshots("web01", None).await.message, "All snapshots removed successfully from VM 'web01'");
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_timeout_overrides_the_configured_default() {
        let fake = lab();
        fake.set_forest("vm-1", vec![snap("s1", "base", vec![])]);
        fake.script_task("task-1", vec![Ok(TaskStatus::running(Some(30)))]);
        fake.script_task("task-2", vec![Ok(TaskStatus::running(Some(80)))]);
        let svc = service(&fake, PlacementDefaults::default()).await;
        let spec = CreateSnapshotSpec { name: "pre-upgrade".into(), description: String::new(), memory: false, quiesce: false };

        let started = tokio::time::Instant::now();
        let result = svc.create_snapshot("web01", &spec, Some(7)).await;
        assert_eq!(result.kind, OutcomeKind::Timeout);
        assert!(result.message.contains("within 7s"), "{}", result.message);
        assert!(started.elapsed() < std::time::Duration::from_secs(60));

        let result = svc.revert_snapshot("web01", "base", Some(3)).await;
        assert_eq!(result.kind, OutcomeKind::Timeout);
        assert!(result.message.contains("within 3s"), "{}", result.message);
        assert_eq!(result.payload.unwrap()["progress"], 80);
    }

    #[tokio::test]
    async fn watch_narrows_to_named_objects() {
        let fake = lab();
        let svc = service(&fake, PlacementDefaults::default()).await;
        let request = WatchRequest {
            object_type: "VirtualMachine".into(),
            properties: vec!["runtime.powerState".into()],
            max_wait_seconds: Some(1),
            max_iterations: Some(1),
            objects: Some(vec!["web01".into()]),
        };

        let result = svc.wait_for_updates(&request, &CancelFlag::new()).await;
        assert!(result.is_ok());
        assert_eq!(fake.calls_matching("open_cursor"), ["open_cursor(vm-1; runtime.powerState)"]);

        let bad = WatchRequest { object_type: "Toaster".into(), ..request };
        assert_eq!(svc.wait_for_updates(&bad, &CancelFlag::new()).await.kind, OutcomeKind::NotFound);
    }

    #[tokio::test]
    async fn wait_for_task_exposes_the_waiter() {
        let fake = lab();
        fake.script_task("task-77", vec![Ok(TaskStatus::succeeded(Some(json!("vm-9"))))]);
        let svc = service(&fake, PlacementDefaults::default()).await;

        let result = svc.wait_for_task("task-77", Some(5)).await;
        assert_eq!(result.message, "Task task-77 completed successfully");
        assert_eq!(result.payload, Some(json!("vm-9")));
    }
}
