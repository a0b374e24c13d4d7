//! Remote endpoint traits and their vSphere implementation.
//!
//! The coordination core (task waiter, snapshot navigator, change watcher)
//! only ever talks to these traits, so it can be driven by
//! [`crate::testing::FakeHypervisor`] in tests and by [`VsphereApi`] in
//! production.

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::host::HostManager;
use crate::metrics::MetricsManager;
use crate::resolver;
use crate::soap::{decode_snapshot_trees, decode_task_info, kinds_of, ObjectSelection, SoapClient};
use crate::types::*;
use crate::vm::VmManager;
use crate::vsphere::VsphereClient;
use crate::xml::el;

use async_trait::async_trait;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Current state of a remote task. Read-only.
    async fn task_status(&self, task: &TaskRef) -> VsphereResult<TaskStatus>;
}

#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// The VM's snapshot forest, roots first, children in creation order.
    async fn snapshot_forest(&self, vm: &ObjectRef) -> VsphereResult<Vec<RemoteSnapshot>>;

    async fn create_snapshot(&self, vm: &ObjectRef, spec: &CreateSnapshotSpec) -> VsphereResult<Submitted>;

    async fn remove_snapshot(&self, snapshot: &ObjectRef, remove_children: bool) -> VsphereResult<Submitted>;

    async fn revert_snapshot(&self, snapshot: &ObjectRef) -> VsphereResult<Submitted>;
}

#[async_trait]
pub trait PropertyApi: Send + Sync {
    /// Create a fresh change cursor for `spec`.
    async fn open_cursor(&self, spec: &WatchSpec) -> VsphereResult<CursorHandle>;

    /// Block up to `max_wait_secs` for changes after `version`. `None` means
    /// the wait elapsed with nothing to report.
    async fn wait_for_updates(
        &self,
        cursor: &CursorHandle,
        version: &str,
        max_wait_secs: u64,
    ) -> VsphereResult<Option<UpdateBatch>>;

    async fn close_cursor(&self, cursor: &CursorHandle) -> VsphereResult<()>;

    async fn retrieve_properties(&self, obj: &ObjectRef, paths: &[&str]) -> VsphereResult<ObjectProperties>;

    /// Every object of `kind` in the inventory.
    async fn retrieve_by_kind(&self, kind: ObjectKind, paths: &[&str]) -> VsphereResult<Vec<ObjectProperties>>;
}

#[async_trait]
pub trait InventoryApi: Send + Sync {
    async fn list_vms(&self) -> VsphereResult<Vec<VmSummary>>;

    async fn list_hosts(&self) -> VsphereResult<Vec<HostSummary>>;

    async fn create_vm(&self, spec: &VmCreateSpec) -> VsphereResult<Submitted>;

    async fn clone_vm(&self, spec: &VmCloneSpec) -> VsphereResult<Submitted>;

    async fn destroy_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted>;

    async fn power_on_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted>;

    async fn power_off_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted>;

    async fn perf_counters(&self) -> VsphereResult<Vec<PerfCounterInfo>>;

    /// Latest realtime sample of each counter, all instances.
    async fn query_perf(&self, entity: &ObjectRef, counter_ids: &[i32]) -> VsphereResult<Vec<PerfSeries>>;
}

/// Maps human-readable names to remote references.
#[async_trait]
pub trait InventoryResolver: Send + Sync {
    async fn resolve(&self, kind: ObjectKind, name: &str) -> VsphereResult<Option<ObjectRef>>;
}

/// Everything the orchestration facade needs from the remote side.
pub trait ManagementApi: TaskApi + SnapshotApi + PropertyApi + InventoryApi + InventoryResolver {}

impl<T> ManagementApi for T where T: TaskApi + SnapshotApi + PropertyApi + InventoryApi + InventoryResolver {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  vSphere implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Live vSphere endpoint: a SOAP session for tasks, snapshots and the
/// property collector plus, on vCenter, a REST session for inventory lookups.
pub struct VsphereApi {
    soap: SoapClient,
    /// `None` when talking to a standalone ESXi host, which has no
    /// `/api/vcenter` surface. Lookups then go through the property collector.
    rest: Option<VsphereClient>,
    config: VsphereConfig,
}

impl VsphereApi {
    /// Log in to both endpoints.
    pub async fn connect(config: &VsphereConfig) -> VsphereResult<Self> {
        let mut soap = SoapClient::new(config)?;
        soap.login().await?;

        let mut rest = VsphereClient::new(config)?;
        let rest = match rest.login(&config.username, &config.password).await {
            Ok(()) => Some(rest),
            Err(e) if matches!(e.kind, VsphereErrorKind::NotFound | VsphereErrorKind::ApiError(404)) => {
                log::info!("REST API unavailable on {} ({e}); using the property collector for lookups", config.host);
                None
            }
            Err(e) => {
                soap.logout().await;
                return Err(e);
            }
        };

        log::info!("Connected to {}:{} as {}", config.host, config.port, config.username);
        Ok(Self { soap, rest, config: config.clone() })
    }

    /// Best effort; failures are logged.
    pub async fn disconnect(&self) {
        if let Some(rest) = &self.rest {
            rest.logout().await;
        }
        self.soap.logout().await;
        log::info!("Disconnected from {}", self.config.host);
    }

    pub fn config(&self) -> &VsphereConfig {
        &self.config
    }

    pub(crate) fn soap(&self) -> &SoapClient {
        &self.soap
    }

    pub(crate) fn rest(&self) -> Option<&VsphereClient> {
        self.rest.as_ref()
    }

    /// Attach a filter for `spec` to a freshly created private collector.
    async fn install_filter(
        &self,
        collector: &ObjectRef,
        spec: &WatchSpec,
        paths: &[&str],
    ) -> VsphereResult<CursorHandle> {
        match &spec.targets {
            WatchTargets::Objects(objs) => {
                let kinds = kinds_of(objs);
                let filter = self
                    .soap
                    .create_filter(collector, &ObjectSelection::Objects(objs), &kinds, paths)
                    .await?;
                Ok(CursorHandle { collector: collector.clone(), filter, view: None })
            }
            WatchTargets::Kind(kind) => {
                let view = self.soap.create_container_view(kind.as_str()).await?;
                let filter = self
                    .soap
                    .create_filter(collector, &ObjectSelection::View(&view), &[kind.as_str()], paths)
                    .await;
                match filter {
                    Ok(filter) => Ok(CursorHandle { collector: collector.clone(), filter, view: Some(view) }),
                    Err(e) => {
                        if let Err(de) = self.soap.destroy_view(&view).await {
                            log::warn!("Failed to destroy container view {}: {de}", view.value);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    fn vms(&self) -> VmManager<'_> {
        VmManager::new(&self.soap, self.rest.as_ref())
    }
}

#[async_trait]
impl TaskApi for VsphereApi {
    async fn task_status(&self, task: &TaskRef) -> VsphereResult<TaskStatus> {
        let obj = ObjectRef::new("Task", task.id.clone());
        let props = self.retrieve_properties(&obj, &["info"]).await?;
        let info = props
            .get("info")
            .ok_or_else(|| VsphereError::parse(format!("Task {task} has no info")))?;
        decode_task_info(info)
    }
}

#[async_trait]
impl SnapshotApi for VsphereApi {
    async fn snapshot_forest(&self, vm: &ObjectRef) -> VsphereResult<Vec<RemoteSnapshot>> {
        let props = self.retrieve_properties(vm, &["snapshot.rootSnapshotList"]).await?;
        Ok(decode_snapshot_trees(props.get("snapshot.rootSnapshotList")))
    }

    async fn create_snapshot(&self, vm: &ObjectRef, spec: &CreateSnapshotSpec) -> VsphereResult<Submitted> {
        let args = format!(
            "{}{}<memory>{}</memory><quiesce>{}</quiesce>",
            el("name", &spec.name),
            el("description", &spec.description),
            spec.memory,
            spec.quiesce
        );
        let task = self.soap.invoke_task("CreateSnapshot_Task", vm, &args).await?;
        Ok(Submitted::Task(task))
    }

    async fn remove_snapshot(&self, snapshot: &ObjectRef, remove_children: bool) -> VsphereResult<Submitted> {
        let args = format!("<removeChildren>{remove_children}</removeChildren><consolidate>true</consolidate>");
        let task = self.soap.invoke_task("RemoveSnapshot_Task", snapshot, &args).await?;
        Ok(Submitted::Task(task))
    }

    async fn revert_snapshot(&self, snapshot: &ObjectRef) -> VsphereResult<Submitted> {
        let task = self.soap.invoke_task("RevertToSnapshot_Task", snapshot, "").await?;
        Ok(Submitted::Task(task))
    }
}

#[async_trait]
impl PropertyApi for VsphereApi {
    async fn open_cursor(&self, spec: &WatchSpec) -> VsphereResult<CursorHandle> {
        let paths: Vec<&str> = spec.properties.iter().map(String::as_str).collect();
        let collector = self.soap.create_property_collector().await?;

        let opened = self.install_filter(&collector, spec, &paths).await;
        if opened.is_err() {
            if let Err(e) = self.soap.destroy_property_collector(&collector).await {
                log::warn!("Failed to destroy property collector {}: {e}", collector.value);
            }
        }
        opened
    }

    async fn wait_for_updates(
        &self,
        cursor: &CursorHandle,
        version: &str,
        max_wait_secs: u64,
    ) -> VsphereResult<Option<UpdateBatch>> {
        self.soap.wait_for_updates(&cursor.collector, version, max_wait_secs).await
    }

    async fn close_cursor(&self, cursor: &CursorHandle) -> VsphereResult<()> {
        let collector = self.soap.destroy_property_collector(&cursor.collector).await;
        if let Some(view) = &cursor.view {
            self.soap.destroy_view(view).await?;
        }
        collector
    }

    async fn retrieve_properties(&self, obj: &ObjectRef, paths: &[&str]) -> VsphereResult<ObjectProperties> {
        let objs = std::slice::from_ref(obj);
        let mut found = self
            .soap
            .retrieve(&ObjectSelection::Objects(objs), &[obj.kind.as_str()], paths)
            .await?;
        match found.pop() {
            Some(mut props) => {
                props.obj.name = obj.name.clone();
                Ok(props)
            }
            None => Err(VsphereError::not_found(format!("{} {} not found", obj.kind, obj.label()))),
        }
    }

    async fn retrieve_by_kind(&self, kind: ObjectKind, paths: &[&str]) -> VsphereResult<Vec<ObjectProperties>> {
        self.soap.retrieve_kind(kind.as_str(), paths).await
    }
}

#[async_trait]
impl InventoryApi for VsphereApi {
    async fn list_vms(&self) -> VsphereResult<Vec<VmSummary>> {
        self.vms().list_vms().await
    }

    async fn list_hosts(&self) -> VsphereResult<Vec<HostSummary>> {
        HostManager::new(&self.soap, self.rest.as_ref()).list_hosts(None).await
    }

    async fn create_vm(&self, spec: &VmCreateSpec) -> VsphereResult<Submitted> {
        self.vms().create_vm(spec).await.map(Submitted::Task)
    }

    async fn clone_vm(&self, spec: &VmCloneSpec) -> VsphereResult<Submitted> {
        self.vms().clone_vm(spec).await.map(Submitted::Task)
    }

    async fn destroy_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted> {
        self.vms().destroy_vm(vm).await.map(Submitted::Task)
    }

    async fn power_on_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted> {
        self.vms().power_on(vm).await.map(Submitted::Task)
    }

    async fn power_off_vm(&self, vm: &ObjectRef) -> VsphereResult<Submitted> {
        self.vms().power_off(vm).await.map(Submitted::Task)
    }

    async fn perf_counters(&self) -> VsphereResult<Vec<PerfCounterInfo>> {
        MetricsManager::new(&self.soap).perf_counters().await
    }

    async fn query_perf(&self, entity: &ObjectRef, counter_ids: &[i32]) -> VsphereResult<Vec<PerfSeries>> {
        MetricsManager::new(&self.soap).query_latest(entity, counter_ids).await
    }
}

#[async_trait]
impl InventoryResolver for VsphereApi {
    async fn resolve(&self, kind: ObjectKind, name: &str) -> VsphereResult<Option<ObjectRef>> {
        resolver::resolve(self, kind, name).await
    }
}
