//! Change watcher: bounded polling of a remote property-change cursor.
//!
//! Each [`ChangeWatcher::watch`] call opens its own cursor, polls it at most
//! `max_iterations` times and closes it again. Cursors never outlive the
//! call that opened them.

use crate::api::PropertyApi;
use crate::outcome::OperationResult;
use crate::types::*;

use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal, checked between iterations only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles signal the same request.
    pub fn same_flag(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEnd {
    IterationLimit,
    Cancelled,
    RemoteError,
}

/// Everything one watch session produced.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchReport {
    /// Non-empty deltas, oldest first.
    pub batches: Vec<UpdateBatch>,
    pub reason: WatchEnd,
    /// Completed wait calls, empty ones included.
    pub iterations: u32,
    pub error: Option<OperationResult>,
    /// Last cursor token received.
    pub version: String,
}

impl WatchReport {
    fn new() -> Self {
        Self {
            batches: Vec::new(),
            reason: WatchEnd::IterationLimit,
            iterations: 0,
            error: None,
            version: String::new(),
        }
    }

    pub fn change_count(&self) -> usize {
        self.batches.iter().map(|b| b.objects.len()).sum()
    }

    /// Collected batches are attached to the payload whatever the reason.
    pub fn into_result(self) -> OperationResult {
        let payload = json!({
            "reason": self.reason,
            "iterations": self.iterations,
            "version": self.version,
            "batches": self.batches,
        });
        let collected = format!(
            "{} change batches ({} object updates) in {} iterations",
            self.batches.len(),
            self.change_count(),
            self.iterations
        );
        let result = match (self.reason, self.error) {
            (WatchEnd::RemoteError, Some(err)) => OperationResult::new(
                err.kind,
                format!("{} (collected {collected} before the failure)", err.message),
            ),
            (WatchEnd::Cancelled, _) => OperationResult::cancelled(format!("Watch cancelled after {collected}")),
            _ => OperationResult::ok(format!("Collected {collected}")),
        };
        result.with_payload(payload)
    }
}

pub struct ChangeWatcher<'a, A: PropertyApi + ?Sized> {
    api: &'a A,
    config: &'a CoordinationConfig,
}

impl<'a, A: PropertyApi + ?Sized> ChangeWatcher<'a, A> {
    pub fn new(api: &'a A, config: &'a CoordinationConfig) -> Self {
        Self { api, config }
    }

    /// Poll `spec` for changes. `None` bounds fall back to the configured
    /// defaults. A budget of zero iterations returns at once without any
    /// remote call.
    pub async fn watch(
        &self,
        spec: &WatchSpec,
        max_iterations: Option<u32>,
        max_wait_secs: Option<u64>,
        cancel: &CancelFlag,
    ) -> WatchReport {
        let max_iterations = max_iterations.unwrap_or(self.config.watch_max_iterations);
        let max_wait = max_wait_secs.unwrap_or(self.config.watch_max_wait_secs);
        let mut report = WatchReport::new();

        if max_iterations == 0 {
            return report;
        }
        if cancel.is_cancelled() {
            report.reason = WatchEnd::Cancelled;
            return report;
        }

        let cursor = match self.api.open_cursor(spec).await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Could not open change cursor: {e}");
                report.reason = WatchEnd::RemoteError;
                report.error = Some(e.into());
                return report;
            }
        };
        log::debug!(
            "Opened change cursor {} for {} properties (max {max_iterations} iterations, {max_wait}s each)",
            cursor.collector.value,
            spec.properties.len()
        );

        while report.iterations < max_iterations {
            if cancel.is_cancelled() {
                report.reason = WatchEnd::Cancelled;
                break;
            }
            match self.api.wait_for_updates(&cursor, &report.version, max_wait).await {
                Ok(Some(batch)) => {
                    report.iterations += 1;
                    log::debug!("Iteration {}: {} object updates", report.iterations, batch.objects.len());
                    report.version = batch.version.clone();
                    if !batch.is_empty() {
                        report.batches.push(batch);
                    }
                }
                Ok(None) => {
                    report.iterations += 1;
                    log::debug!("Iteration {}: no changes within {max_wait}s", report.iterations);
                }
                Err(e) => {
                    log::warn!("Wait for updates failed after {} iterations: {e}", report.iterations);
                    report.reason = WatchEnd::RemoteError;
                    report.error = Some(e.into());
                    break;
                }
            }
        }

        if let Err(e) = self.api.close_cursor(&cursor).await {
            log::warn!("Failed to close change cursor {}: {e}", cursor.collector.value);
        }
        log::debug!("Closed change cursor {} ({:?})", cursor.collector.value, report.reason);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VsphereError;
    use crate::outcome::OutcomeKind;
    use crate::testing::{batch, FakeHypervisor};

    fn vm_power_spec(vm: &ObjectRef) -> WatchSpec {
        WatchSpec {
            targets: WatchTargets::Objects(vec![vm.clone()]),
            properties: vec!["runtime.powerState".into()],
        }
    }

    #[tokio::test]
    async fn zero_iterations_makes_no_remote_call() {
        let fake = FakeHypervisor::new();
        let config = CoordinationConfig::default();
        let vm = ObjectRef::new("VirtualMachine", "vm-1");

        let report = ChangeWatcher::new(&fake, &config)
            .watch(&vm_power_spec(&vm), Some(0), None, &CancelFlag::new())
            .await;
        assert_eq!(report.reason, WatchEnd::IterationLimit);
        assert!(report.batches.is_empty());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn cursor_token_advances_between_iterations() {
        let fake = FakeHypervisor::new();
        let vm = ObjectRef::new("VirtualMachine", "vm-1");
        fake.script_updates(vec![
            Ok(Some(batch("1", &vm, "runtime.powerState", json!("poweredOff")))),
            Ok(None),
            Ok(Some(batch("2", &vm, "runtime.powerState", json!("poweredOn")))),
        ]);
        let config = CoordinationConfig::default();

        let report = ChangeWatcher::new(&fake, &config)
            .watch(&vm_power_spec(&vm), Some(3), Some(5), &CancelFlag::new())
            .await;
        assert_eq!(report.reason, WatchEnd::IterationLimit);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.version, "2");

        let waits = fake.calls_matching("wait_for_updates");
        assert!(waits[0].contains("version=\"\""));
        assert!(waits[1].contains("version=\"1\""));
        assert!(waits[2].contains("version=\"1\""));
        assert!(waits[2].contains("wait=5"));
        assert_eq!(fake.calls_matching("close_cursor").len(), 1);
    }

    #[tokio::test]
    async fn remote_error_keeps_earlier_batches() {
        let fake = FakeHypervisor::new();
        let vm = ObjectRef::new("VirtualMachine", "vm-1");
        fake.script_updates(vec![
            Ok(Some(batch("1", &vm, "runtime.powerState", json!("poweredOff")))),
            Ok(Some(batch("2", &vm, "runtime.powerState", json!("poweredOn")))),
            Err(VsphereError::connection("Connection refused")),
            Ok(Some(batch("4", &vm, "runtime.powerState", json!("suspended")))),
        ]);
        let config = CoordinationConfig::default();

        let report = ChangeWatcher::new(&fake, &config)
            .watch(&vm_power_spec(&vm), Some(5), None, &CancelFlag::new())
            .await;
        assert_eq!(report.reason, WatchEnd::RemoteError);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.batches.len(), 2);
        assert_eq!(fake.calls_matching("wait_for_updates").len(), 3);
        assert_eq!(fake.calls_matching("close_cursor").len(), 1);

        let result = report.into_result();
        assert_eq!(result.kind, OutcomeKind::RemoteError);
        assert!(result.message.starts_with("Connection refused"));
        let payload = result.payload.unwrap();
        assert_eq!(payload["reason"], "remote_error");
        assert_eq!(payload["batches"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_the_cursor_opens() {
        let fake = FakeHypervisor::new();
        let config = CoordinationConfig::default();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = ChangeWatcher::new(&fake, &config)
            .watch(&vm_power_spec(&ObjectRef::new("VirtualMachine", "vm-1")), Some(3), None, &cancel)
            .await;
        assert_eq!(report.reason, WatchEnd::Cancelled);
        assert!(fake.calls().is_empty());
        assert_eq!(report.into_result().kind, OutcomeKind::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_between_iterations_stops_polling() {
        let fake = FakeHypervisor::new();
        let vm = ObjectRef::new("VirtualMachine", "vm-1");
        fake.script_updates(vec![
            Ok(Some(batch("1", &vm, "runtime.powerState", json!("poweredOff")))),
            Ok(Some(batch("2", &vm, "runtime.powerState", json!("poweredOn")))),
            Ok(Some(batch("3", &vm, "runtime.powerState", json!("suspended")))),
        ]);
        let cancel = CancelFlag::new();
        fake.cancel_after_waits(2, cancel.clone());
        let config = CoordinationConfig::default();

        let report = ChangeWatcher::new(&fake, &config)
            .watch(&vm_power_spec(&vm), Some(10), None, &cancel)
            .await;
        assert_eq!(report.reason, WatchEnd::Cancelled);
        assert_eq!(report.iterations, 2);
        let versions: Vec<&str> = report.batches.iter().map(|b| b.version.as_str()).collect();
        assert_eq!(versions, ["1", "2"]);
        assert_eq!(fake.calls_matching("wait_for_updates").len(), 2);
        assert_eq!(fake.calls_matching("close_cursor").len(), 1);

        let result = report.into_result();
        assert_eq!(result.kind, OutcomeKind::Cancelled);
        assert_eq!(result.payload.unwrap()["batches"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn failed_cursor_open_is_a_remote_error() {
        let fake = FakeHypervisor::new();
        fake.fail_open_cursor(VsphereError::fault("InvalidProperty: runtime.bogus"));
        let config = CoordinationConfig::default();

        let report = ChangeWatcher::new(&fake, &config)
            .watch(&vm_power_spec(&ObjectRef::new("VirtualMachine", "vm-1")), None, None, &CancelFlag::new())
            .await;
        assert_eq!(report.reason, WatchEnd::RemoteError);
        assert_eq!(report.error.map(|e| e.message), Some("InvalidProperty: runtime.bogus".to_string()));
        assert!(fake.calls_matching("close_cursor").is_empty());
    }

    #[test]
    fn iteration_limit_result_is_ok() {
        let vm = ObjectRef::new("VirtualMachine", "vm-1");
        let mut report = WatchReport::new();
        report.iterations = 1;
        report.batches.push(batch("1", &vm, "name", json!("web01")));
        let result = report.into_result();
        assert!(result.is_ok());
        assert_eq!(result.message, "Collected 1 change batches (1 object updates) in 1 iterations");
    }
}
