//! Scripted in-memory hypervisor for tests.
//!
//! Implements every remote endpoint trait, records each call in order and
//! replays scripted task statuses, snapshot forests and update batches.
//! Mutations complete as a task whose status script is decided when the
//! mutation is issued, so tests can make a specific removal fail.

use crate::api::{InventoryApi, InventoryResolver, PropertyApi, SnapshotApi, TaskApi};
use crate::error::{VsphereError, VsphereResult};
use crate::types::*;
use crate::watcher::CancelFlag;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Build a snapshot node for a scripted forest.
pub fn snap(id: &str, name: &str, children: Vec<RemoteSnapshot>) -> RemoteSnapshot {
    RemoteSnapshot {
        reference: ObjectRef::new("VirtualMachineSnapshot", id),
        name: name.to_string(),
        description: String::new(),
        create_time: Some("2024-05-01T10:00:00Z".to_string()),
        state: Some("poweredOff".to_string()),
        quiesced: false,
        children,
    }
}

/// An update batch touching one object.
pub fn batch(version: &str, obj: &ObjectRef, property: &str, value: Value) -> UpdateBatch {
    UpdateBatch {
        version: version.to_string(),
        objects: vec![ObjectUpdate {
            obj: obj.clone(),
            kind: "modify".to_string(),
            changes: vec![PropertyChange { name: property.to_string(), op: "assign".to_string(), value: Some(value) }],
        }],
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    next_task: u64,
    tasks: HashMap<String, VecDeque<VsphereResult<TaskStatus>>>,
    /// Task failure detail for mutations on a given object id.
    failing_targets: HashMap<String, String>,
    /// Errors returned by the mutating call itself.
    rejected_targets: HashMap<String, VsphereError>,
    /// Result payload for the task of a mutation on a given object id.
    task_results: HashMap<String, Value>,
    forests: HashMap<String, Vec<RemoteSnapshot>>,
    updates: VecDeque<VsphereResult<Option<UpdateBatch>>>,
    open_cursor_error: Option<VsphereError>,
    /// Flag raised once this many `wait_for_updates` calls have returned.
    cancel_after_waits: Option<(usize, CancelFlag)>,
    waits: usize,
    /// Errors returned by `resolve` for a given name.
    resolve_errors: HashMap<String, VsphereError>,
    objects: Vec<(ObjectKind, ObjectRef)>,
    properties: HashMap<String, Map<String, Value>>,
    vms: Vec<VmSummary>,
    hosts: Vec<HostSummary>,
    counters: Vec<PerfCounterInfo>,
    perf: Vec<PerfSeries>,
    perf_error: Option<VsphereError>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    fn record(&self, call: String) {
        self.with_state(|s| s.calls.push(call));
    }

    // ── Scripting ───────────────────────────────────────────────────

    /// Status sequence for a task. The last entry repeats forever.
    ///
    /// Mutations hand out ids `task-1`, `task-2`, ... in call order, so a
    /// test can script the task a later mutation will return.
    pub fn script_task(&self, task_id: &str, statuses: Vec<VsphereResult<TaskStatus>>) {
        self.with_state(|s| {
            s.tasks.insert(task_id.to_string(), statuses.into());
        });
    }

    /// Tasks for mutations on `target` fail with `detail`.
    pub fn fail_tasks_on(&self, target: &str, detail: &str) {
        self.with_state(|s| {
            s.failing_targets.insert(target.to_string(), detail.to_string());
        });
    }

    /// Mutating calls on `target` are rejected outright.
    pub fn reject_calls_on(&self, target: &str, error: VsphereError) {
        self.with_state(|s| {
            s.rejected_targets.insert(target.to_string(), error);
        });
    }

    /// Tasks for mutations on `target` succeed with `result`.
    pub fn task_result_for(&self, target: &str, result: Value) {
        self.with_state(|s| {
            s.task_results.insert(target.to_string(), result);
        });
    }

    pub fn set_forest(&self, vm_id: &str, roots: Vec<RemoteSnapshot>) {
        self.with_state(|s| {
            s.forests.insert(vm_id.to_string(), roots);
        });
    }

    /// Responses for successive `wait_for_updates` calls.
    pub fn script_updates(&self, responses: Vec<VsphereResult<Option<UpdateBatch>>>) {
        self.with_state(|s| s.updates = responses.into());
    }

    pub fn fail_open_cursor(&self, error: VsphereError) {
        self.with_state(|s| s.open_cursor_error = Some(error));
    }

    /// Cancel `flag` as the `waits`-th `wait_for_updates` call returns.
    pub fn cancel_after_waits(&self, waits: usize, flag: CancelFlag) {
        self.with_state(|s| s.cancel_after_waits = Some((waits, flag)));
    }

    /// Looking up `name` fails with `error`.
    pub fn fail_resolve(&self, name: &str, error: VsphereError) {
        self.with_state(|s| {
            s.resolve_errors.insert(name.to_string(), error);
        });
    }

    /// Register a resolvable object.
    pub fn add_object(&self, kind: ObjectKind, vim_type: &str, id: &str, name: &str) -> ObjectRef {
        let obj = ObjectRef::named(vim_type, id, name);
        self.with_state(|s| {
            s.objects.push((kind, obj.clone()));
            s.properties.entry(id.to_string()).or_default().insert("name".into(), name.into());
        });
        obj
    }

    /// Register a VM, resolvable and listed.
    pub fn add_vm(&self, id: &str, name: &str, power: &str) -> ObjectRef {
        let obj = self.add_object(ObjectKind::VirtualMachine, "VirtualMachine", id, name);
        self.set_property(id, "runtime.powerState", power.into());
        self.with_state(|s| {
            s.vms.push(VmSummary {
                vm: id.to_string(),
                name: name.to_string(),
                power_state: VmPowerState::from_vim(power),
                cpu_count: None,
                memory_size_mib: None,
            })
        });
        obj
    }

    /// Register a host, resolvable and listed.
    pub fn add_host(&self, id: &str, name: &str) -> ObjectRef {
        let obj = self.add_object(ObjectKind::HostSystem, "HostSystem", id, name);
        self.with_state(|s| {
            s.hosts.push(HostSummary {
                host: id.to_string(),
                name: name.to_string(),
                connection_state: Some("CONNECTED".into()),
                power_state: Some("POWERED_ON".into()),
            })
        });
        obj
    }

    pub fn set_property(&self, id: &str, path: &str, value: Value) {
        self.with_state(|s| {
            s.properties.entry(id.to_string()).or_default().insert(path.to_string(), value);
        });
    }

    pub fn set_perf(&self, counters: Vec<PerfCounterInfo>, series: Vec<PerfSeries>) {
        self.with_state(|s| {
            s.counters = counters;
            s.perf = series;
        });
    }

    pub fn fail_perf(&self, error: VsphereError) {
        self.with_state(|s| s.perf_error = Some(error));
    }

    /// Standalone-host inventory: datacenter `DC1` with VM folder
    /// `group-v1`, compute resource `esx01` (pool `resgroup-1`) and
    /// datastore `datastore1`. Enough for the facade to resolve placement.
    pub fn standalone_host() -> Self {
        let fake = Self::new();
        fake.add_object(ObjectKind::Datacenter, "Datacenter", "datacenter-1", "DC1");
        fake.set_property("datacenter-1", "vmFolder", serde_json::json!({"type": "Folder", "value": "group-v1"}));
        fake.set_property("datacenter-1", "hostFolder", serde_json::json!({"type": "Folder", "value": "group-h1"}));
        fake.set_property(
            "datacenter-1",
            "datastore",
            serde_json::json!([{"type": "Datastore", "value": "datastore-1"}]),
        );
        fake.set_property("datacenter-1", "network", serde_json::json!([]));
        fake.add_object(ObjectKind::ComputeResource, "ComputeResource", "domain-s1", "esx01");
        fake.set_property("domain-s1", "parent", serde_json::json!({"type": "Folder", "value": "group-h1"}));
        fake.set_property("domain-s1", "resourcePool", serde_json::json!({"type": "ResourcePool", "value": "resgroup-1"}));
        fake.add_object(ObjectKind::Datastore, "Datastore", "datastore-1", "datastore1");
        fake.set_property("datastore-1", "summary.freeSpace", serde_json::json!(500_000_000_000_i64));
        fake
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.with_state(|s| s.calls.iter().filter(|c| c.starts_with(prefix)).cloned().collect())
    }

    pub fn forest(&self, vm_id: &str) -> Vec<RemoteSnapshot> {
        self.with_state(|s| s.forests.get(vm_id).cloned().unwrap_or_default())
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Issue a task for a mutation on `target`, applying `effect` when the
    /// task is scripted to succeed.
    fn submit(&self, target: &str, effect: impl FnOnce(&mut FakeState)) -> VsphereResult<Submitted> {
        self.with_state(|s| -> VsphereResult<Submitted> {
            if let Some(err) = s.rejected_targets.get(target) {
                return Err(err.clone());
            }
            s.next_task += 1;
            let id = format!("task-{}", s.next_task);
            // A task id scripted ahead of time keeps its script and has no effect.
            if s.tasks.contains_key(&id) {
                return Ok(Submitted::Task(TaskRef::new(id)));
            }
            let status = match s.failing_targets.get(target) {
                Some(detail) => TaskStatus::failed(detail.clone()),
                None => {
                    effect(s);
                    TaskStatus::succeeded(s.task_results.get(target).cloned())
                }
            };
            s.tasks.insert(id.clone(), VecDeque::from([Ok(status)]));
            Ok(Submitted::Task(TaskRef::new(id)))
        })
    }
}

/// Remove the node with `id` from a forest. Without `remove_children` its
/// children take its place.
fn remove_node(nodes: &mut Vec<RemoteSnapshot>, id: &str, remove_children: bool) -> bool {
    if let Some(pos) = nodes.iter().position(|n| n.reference.value == id) {
        let node = nodes.remove(pos);
        if !remove_children {
            for (offset, child) in node.children.into_iter().enumerate() {
                nodes.insert(pos + offset, child);
            }
        }
        return true;
    }
    nodes.iter_mut().any(|n| remove_node(&mut n.children, id, remove_children))
}

#[async_trait]
impl TaskApi for FakeHypervisor {
    async fn task_status(&self, task: &TaskRef) -> VsphereResult<TaskStatus> {
        self.record(format!("task_status({task})"));
        self.with_state(|s| -> VsphereResult<TaskStatus> {
            let script = s
                .tasks
                .get_mut(&task.id)
                .ok_or_else(|| VsphereError::not_found(format!("Task {task} not found")))?;
            let next = if script.len() > 1 { script.pop_front() } else { script.front().cloned() };
            next.unwrap_or_else(|| Err(VsphereError::not_found(format!("Task {task} has no script"))))
        })
    }
}

#[async_trait]
impl SnapshotApi for FakeHypervisor {
    async fn snapshot_forest(&self, vm: &ObjectRef) -> VsphereResult<Vec<RemoteSnapshot>> {
        self.record(format!("snapshot_forest({})", vm.value));
        Ok(self.forest(&vm.value))
    }

    async fn create_snapshot(&self, vm: &ObjectRef, spec: &CreateSnapshotSpec) -> VsphereResult<Submitted> {
        self.record(format!("create_snapshot({}, {})", vm.value, spec.name));
        let vm_id = vm.value.clone();
        let name = spec.name.clone();
        self.submit(&vm.value, move |s| {
            let forest = s.forests.entry(vm_id).or_default();
            let id = format!("snapshot-new-{}", s.next_task);
            forest.push(snap(&id, &name, Vec::new()));
        })
    }

    async fn remove_snapshot(&self, snapshot: &ObjectRef, remove_children: bool) -> VsphereResult<Submitted> {
        self.record(format!("remove_snapshot({}, children={remove_children})", snapshot.value));
        let id = snapshot.value.clone();
        self.submit(&snapshot.value, move |s| {
            for forest in s.forests.values_mut() {
                if remove_node(forest, &id, remove_children) {
                    break;
                }
            }
        })
    }

    async fn revert_snapshot(&self, snapshot: &ObjectRef) -> VsphereResult<Submitted> {
        self.record(format!("revert_snapshot({})", snapshot.value));
        self.submit(&snapshot.value, |_| {})
    }
}

#[async_trait]
impl PropertyApi for FakeHypervisor {
    async fn open_cursor(&self, spec: &WatchSpec) -> VsphereResult<CursorHandle> {
        let targets = match &spec.targets {
            WatchTargets::Objects(objs) => objs.iter().map(|o| o.value.as_str()).collect::<Vec<_>>().join(","),
            WatchTargets::Kind(kind) => kind.to_string(),
        };
        self.record(format!("open_cursor({targets}; {})", spec.properties.join(",")));
        if let Some(err) = self.with_state(|s| s.open_cursor_error.clone()) {
            return Err(err);
        }
        let n = self.with_state(|s| s.calls.len());
        Ok(CursorHandle {
            collector: ObjectRef::new("PropertyCollector", format!("session[{n}]collector")),
            filter: ObjectRef::new("PropertyFilter", format!("session[{n}]filter")),
            view: None,
        })
    }

    async fn wait_for_updates(
        &self,
        cursor: &CursorHandle,
        version: &str,
        max_wait_secs: u64,
    ) -> VsphereResult<Option<UpdateBatch>> {
        self.record(format!("wait_for_updates({}, version={version:?}, wait={max_wait_secs})", cursor.collector.value));
        self.with_state(|s| {
            s.waits += 1;
            if let Some((after, flag)) = &s.cancel_after_waits {
                if s.waits == *after {
                    flag.cancel();
                }
            }
            s.updates.pop_front().unwrap_or(Ok(None))
        })
    }

    async fn close_cursor(&self, cursor: &CursorHandle) -> VsphereResult<()> {
        self.record(format!("close_cursor({})", cursor.collector.value));
        Ok(())
    }

    async fn retrieve_properties(&self, obj: &ObjectRef, paths: &[&str]) -> VsphereResult<ObjectProperties> {
        self.record(format!("retrieve_properties({}; {})", obj.value, paths.join(",")));
        self.with_state(|s| -> VsphereResult<ObjectProperties> {
            let all = s
                .properties
                .get(&obj.value)
                .ok_or_else(|| VsphereError::not_found(format!("{} {} not found", obj.kind, obj.label())))?;
            let props = all
                .iter()
                .filter(|(k, _)| paths.is_empty() || paths.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(ObjectProperties { obj: obj.clone(), props })
        })
    }

    async fn retrieve_by_kind(&self, kind: ObjectKind, paths: &[&str]) -> VsphereResult<Vec<ObjectProperties>> {
        self.record(format!("retrieve_by_kind({kind}; {})", paths.join(",")));
        self.with_state(|s| {
            Ok(s.objects
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, obj)| {
                    let props = s
                        .properties
                        .get(&obj.value)
                        .map(|all| {
                            all.iter()
                                .filter(|(k, _)| paths.is_empty() || paths.contains(&k.as_str()))
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect()
                        })
                        .unwrap_or_default();
                    ObjectProperties { obj: ObjectRef { name: None, ..obj.clone() }, props }
                })
                .collect())
        })
    }
}

#[async_trait]
impl InventoryApi for FakeHypervisor {
    async fn list_vms(&self) -> VsphereResult<Vec<VmSummary>> {
        self.record("list_vms".into());
        Ok(self.with_state(|s| s.vms.clone()))
    }

    async fn list_hosts(&self) -> VsphereResult<Vec<HostSummary>> {
        self.record("list_hosts".into());
        Ok(self.with_state(|s| s.hosts.clone()))
    }

    async fn create_vm(&self, spec: &VmCreateSpec) -> VsphereResult<Submitted> {
        self.record(format!(
            "create_vm({}, cpu={}, mem={}, disk={}, ds={}, net={})",
            spec.name,
            spec.cpu_count,
            spec.memory_mb,
            spec.disk_size_gb,
            spec.placement.datastore.value,
            spec.placement.network.as_ref().map_or("-", |n| n.value.as_str())
        ));
        self.submit(&spec.placement.folder.value, |_| {})
    }

    async fn clone_vm(&self, spec: &VmCloneSpec) -> VsphereResult<Submitted> {
        self.record(format!(
            "clone_vm({} -> {}, folder={}, pool={})",
            spec.source.value, spec.name, spec.folder.value, spec.resource_pool.value
        ));
        self.submit(&spec.source.value, |_| {})
    }

    async fn destroy_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted> {
        self.record(format!("destroy_vm({})", vm.value));
        self.submit(&vm.value, |_| {})
    }

    async fn power_on_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted> {
        self.record(format!("power_on_vm({})", vm.value));
        let id = vm.value.clone();
        self.submit(&vm.value, move |s| {
            s.properties.entry(id).or_default().insert("runtime.powerState".into(), "poweredOn".into());
        })
    }

    async fn power_off_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted> {
        self.record(format!("power_off_vm({})", vm.value));
        let id = vm.value.clone();
        self.submit(&vm.value, move |s| {
            s.properties.entry(id).or_default().insert("runtime.powerState".into(), "poweredOff".into());
        })
    }

    async fn perf_counters(&self) -> VsphereResult<Vec<PerfCounterInfo>> {
        self.record("perf_counters".into());
        Ok(self.with_state(|s| s.counters.clone()))
    }

    async fn query_perf(&self, entity: &ObjectRef, counter_ids: &[i32]) -> VsphereResult<Vec<PerfSeries>> {
        self.record(format!("query_perf({}; {counter_ids:?})", entity.value));
        self.with_state(|s| match &s.perf_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.perf.iter().filter(|p| counter_ids.contains(&p.counter_id)).cloned().collect()),
        })
    }
}

#[async_trait]
impl InventoryResolver for FakeHypervisor {
    async fn resolve(&self, kind: ObjectKind, name: &str) -> VsphereResult<Option<ObjectRef>> {
        self.record(format!("resolve({kind}, {name})"));
        self.with_state(|s| {
            if let Some(err) = s.resolve_errors.get(name) {
                return Err(err.clone());
            }
            Ok(s.objects
                .iter()
                .find(|(k, o)| *k == kind && o.name.as_deref() == Some(name))
                .map(|(_, o)| o.clone()))
        })
    }
}
