//! Snapshot tree navigation and mutation.
//!
//! The snapshot forest belongs to the remote side. Every operation fetches
//! it fresh, flattens it into a [`SnapshotForest`] arena and drops it when
//! the request ends. Mutations are issued one at a time and each is awaited
//! through the [`TaskWaiter`] before the next one starts.

use crate::api::{SnapshotApi, TaskApi};
use crate::error::VsphereResult;
use crate::outcome::{OperationResult, OutcomeKind};
use crate::task::TaskWaiter;
use crate::types::*;

use serde::Serialize;
use serde_json::json;

// ── Arena ───────────────────────────────────────────────────────────

/// One snapshot, flattened out of the remote tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotNode {
    pub reference: ObjectRef,
    pub name: String,
    pub description: String,
    pub create_time: Option<String>,
    pub state: Option<String>,
    pub quiesced: bool,
    /// Distance from the nearest root.
    pub depth: usize,
    #[serde(skip)]
    pub parent: Option<usize>,
    #[serde(skip)]
    pub children: Vec<usize>,
}

/// Point-in-time copy of a VM's snapshot forest.
///
/// `nodes` is in depth-first preorder with children in creation order, so
/// iterating it is the listing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotForest {
    nodes: Vec<SnapshotNode>,
    roots: Vec<usize>,
}

impl SnapshotForest {
    pub fn from_remote(roots: Vec<RemoteSnapshot>) -> Self {
        let mut forest = Self::default();
        for root in roots {
            let idx = forest.push(root, 0, None);
            forest.roots.push(idx);
        }
        forest
    }

    fn push(&mut self, remote: RemoteSnapshot, depth: usize, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(SnapshotNode {
            reference: remote.reference,
            name: remote.name,
            description: remote.description,
            create_time: remote.create_time,
            state: remote.state,
            quiesced: remote.quiesced,
            depth,
            parent,
            children: Vec::new(),
        });
        for child in remote.children {
            let child_idx = self.push(child, depth + 1, Some(idx));
            self.nodes[idx].children.push(child_idx);
        }
        idx
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[SnapshotNode] {
        &self.nodes
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn node(&self, idx: usize) -> &SnapshotNode {
        &self.nodes[idx]
    }

    /// Every node named `name`, in depth-first order.
    pub fn matches(&self, name: &str) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| self.nodes[i].name == name).collect()
    }

    /// First node named `name` in depth-first order.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// The subtree under `idx`, children before parents.
    pub fn post_order(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_post_order(idx, &mut out);
        out
    }

    fn collect_post_order(&self, idx: usize, out: &mut Vec<usize>) {
        for &child in &self.nodes[idx].children {
            self.collect_post_order(child, out);
        }
        out.push(idx);
    }
}

/// Listing row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub description: String,
    pub create_time: Option<String>,
    pub state: Option<String>,
    pub level: usize,
}

impl From<&SnapshotNode> for SnapshotEntry {
    fn from(n: &SnapshotNode) -> Self {
        Self {
            name: n.name.clone(),
            description: n.description.clone(),
            create_time: n.create_time.clone(),
            state: n.state.clone(),
            level: n.depth,
        }
    }
}

// ── Removal reports ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovalFailure {
    pub snapshot: String,
    pub kind: OutcomeKind,
    pub message: String,
}

/// Per-node outcome of removing one subtree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemovalReport {
    pub root: String,
    pub removed: Vec<String>,
    pub failed: Option<RemovalFailure>,
    /// Not attempted because an earlier removal in the subtree failed.
    pub skipped: Vec<String>,
}

impl RemovalReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

// ── Navigator ───────────────────────────────────────────────────────

/// Locates and mutates snapshots of one endpoint.
pub struct SnapshotNavigator<'a, A: SnapshotApi + TaskApi + ?Sized> {
    api: &'a A,
    waiter: &'a TaskWaiter,
    timeout_secs: Option<u64>,
}

impl<'a, A: SnapshotApi + TaskApi + ?Sized> SnapshotNavigator<'a, A> {
    pub fn new(api: &'a A, waiter: &'a TaskWaiter) -> Self {
        Self { api, waiter, timeout_secs: None }
    }

    /// Per-task wait bound; the waiter's configured default otherwise.
    pub fn with_timeout(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub async fn forest(&self, vm: &ObjectRef) -> Result<SnapshotForest, OperationResult> {
        let roots = self.api.snapshot_forest(vm).await.map_err(OperationResult::from)?;
        Ok(SnapshotForest::from_remote(roots))
    }

    /// First snapshot named `name` in depth-first order. Duplicate names are
    /// resolved silently to that first match; a warning is logged.
    pub async fn find(&self, vm: &ObjectRef, name: &str) -> Result<SnapshotNode, OperationResult> {
        let forest = self.forest(vm).await?;
        locate(&forest, vm, name).map(|idx| forest.node(idx).clone())
    }

    pub async fn list_all(&self, vm: &ObjectRef) -> Result<Vec<SnapshotEntry>, OperationResult> {
        let forest = self.forest(vm).await?;
        Ok(forest.nodes().iter().map(SnapshotEntry::from).collect())
    }

    pub async fn create(&self, vm: &ObjectRef, spec: &CreateSnapshotSpec) -> OperationResult {
        log::info!("Creating snapshot '{}' on VM '{}'", spec.name, vm.label());
        let result = self
            .run(self.api.create_snapshot(vm, spec).await)
            .await
            .on_success(format!("Snapshot '{}' created successfully for VM '{}'", spec.name, vm.label()));
        if result.kind == OutcomeKind::Timeout {
            return OperationResult {
                message: format!(
                    "{}. Retrying create_snapshot now could leave a duplicate snapshot named '{}'.",
                    result.message, spec.name
                ),
                ..result
            };
        }
        result
    }

    pub async fn remove(&self, vm: &ObjectRef, name: &str, remove_children: bool) -> OperationResult {
        let forest = match self.forest(vm).await {
            Ok(f) => f,
            Err(r) => return r,
        };
        let idx = match locate(&forest, vm, name) {
            Ok(idx) => idx,
            Err(r) => return r,
        };
        let success = format!("Snapshot '{name}' removed successfully from VM '{}'", vm.label());

        if remove_children {
            let report = self.remove_subtree(&forest, idx, vm).await;
            return match &report.failed {
                None => OperationResult::ok(success).with_payload(json!(report)),
                Some(f) => OperationResult::new(
                    f.kind,
                    format!(
                        "Removal of snapshot '{name}' from VM '{}' stopped at '{}' after {} of {} removals: {}",
                        vm.label(),
                        f.snapshot,
                        report.removed.len(),
                        report.removed.len() + report.skipped.len() + 1,
                        f.message
                    ),
                )
                .with_payload(json!(report)),
            };
        }

        let node = forest.node(idx);
        log::info!("Removing snapshot '{}' ({}) from VM '{}', keeping children", node.name, node.reference.value, vm.label());
        let result = self.run(self.api.remove_snapshot(&node.reference, false).await).await;
        if result.kind == OutcomeKind::RemoteError && !node.children.is_empty() {
            return OperationResult::precondition_failed(result.message);
        }
        result.on_success(success)
    }

    /// Revert the VM to `name`. Later snapshots are left in place.
    pub async fn revert(&self, vm: &ObjectRef, name: &str) -> OperationResult {
        let node = match self.find(vm, name).await {
            Ok(n) => n,
            Err(r) => return r,
        };
        log::info!("Reverting VM '{}' to snapshot '{}'", vm.label(), node.name);
        self.run(self.api.revert_snapshot(&node.reference).await)
            .await
            .on_success(format!("VM '{}' reverted successfully to snapshot '{name}'", vm.label()))
    }

    /// Remove every root subtree in order. A failed subtree does not stop
    /// the next one.
    pub async fn remove_all(&self, vm: &ObjectRef) -> OperationResult {
        let forest = match self.forest(vm).await {
            Ok(f) => f,
            Err(r) => return r,
        };
        if forest.is_empty() {
            return OperationResult::ok(format!("VM '{}' has no snapshots to remove", vm.label()));
        }

        let mut reports = Vec::with_capacity(forest.roots().len());
        for &root in forest.roots() {
            reports.push(self.remove_subtree(&forest, root, vm).await);
        }

        let removed: usize = reports.iter().map(|r| r.removed.len()).sum();
        let payload = json!({ "results": reports });
        match reports.iter().find_map(|r| r.failed.as_ref()) {
            None => OperationResult::ok(format!("All snapshots removed successfully from VM '{}'", vm.label()))
                .with_payload(payload),
            Some(first) => {
                let failed = reports.iter().filter(|r| !r.is_complete()).count();
                OperationResult::new(
                    first.kind,
                    format!(
                        "Removed {removed} of {} snapshots from VM '{}'; {failed} of {} snapshot trees failed. First failure at '{}': {}",
                        forest.len(),
                        vm.label(),
                        reports.len(),
                        first.snapshot,
                        first.message
                    ),
                )
                .with_payload(payload)
            }
        }
    }

    /// Remove the subtree at `idx` node by node, children first, stopping
    /// at the first failure.
    async fn remove_subtree(&self, forest: &SnapshotForest, idx: usize, vm: &ObjectRef) -> RemovalReport {
        let order = forest.post_order(idx);
        let mut report = RemovalReport { root: forest.node(idx).name.clone(), ..RemovalReport::default() };

        for (pos, &i) in order.iter().enumerate() {
            let node = forest.node(i);
            log::info!("Removing snapshot '{}' ({}) from VM '{}'", node.name, node.reference.value, vm.label());
            let result = self.run(self.api.remove_snapshot(&node.reference, false).await).await;
            if result.is_ok() {
                report.removed.push(node.name.clone());
                continue;
            }
            log::warn!("Removing snapshot '{}' from VM '{}' failed: {}", node.name, vm.label(), result.message);
            report.failed = Some(RemovalFailure { snapshot: node.name.clone(), kind: result.kind, message: result.message });
            report.skipped = order[pos + 1..].iter().map(|&j| forest.node(j).name.clone()).collect();
            break;
        }
        report
    }

    async fn run(&self, submitted: VsphereResult<Submitted>) -> OperationResult {
        match submitted {
            Ok(s) => self.waiter.complete(self.api, s, self.timeout_secs).await,
            Err(e) => e.into(),
        }
    }
}

fn locate(forest: &SnapshotForest, vm: &ObjectRef, name: &str) -> Result<usize, OperationResult> {
    if forest.is_empty() {
        return Err(OperationResult::not_found(format!("VM '{}' has no snapshots", vm.label())));
    }
    let matches = forest.matches(name);
    match matches.first() {
        None => Err(OperationResult::not_found(format!("Snapshot '{name}' not found on VM '{}'", vm.label()))),
        Some(&first) => {
            if matches.len() > 1 {
                log::warn!(
                    "{} snapshots on VM '{}' are named '{name}'; using the first in depth-first order ({})",
                    matches.len(),
                    vm.label(),
                    forest.node(first).reference.value
                );
            }
            Ok(first)
        }
    }
}
