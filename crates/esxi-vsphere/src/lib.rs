//! # ESXi / vSphere binding and coordination core
//!
//! Talks to vCenter and standalone ESXi hosts through the vSphere SOAP API
//! (tasks, snapshots, the property collector) and, where available, the
//! vCenter REST API (inventory lookups).
//!
//! ## Modules
//!
//! - **types** — Shared data structures (handles, task states, snapshots, watch specs)
//! - **error** — Crate-specific error types
//! - **outcome** — Uniform `OperationResult` returned by every operation
//! - **api** — Capability traits and the live `VsphereApi` implementation
//! - **soap** / **xml** — SOAP envelope transport and decoding
//! - **vsphere** — vSphere REST API HTTP client with session-based auth
//! - **vm** / **host** / **network** / **storage** / **metrics** — Per-area managers
//! - **resolver** — Name to handle lookup
//! - **task** — Task waiter
//! - **snapshot** — Snapshot tree navigator
//! - **watcher** — Bounded change watcher
//! - **reports** — Report shaping for VMs, hosts, datastores and networks
//! - **service** — Aggregate facade

pub mod types;
pub mod error;
pub mod outcome;
pub mod xml;
pub mod soap;
pub mod vsphere;
pub mod vm;
pub mod host;
pub mod network;
pub mod storage;
pub mod metrics;
pub mod resolver;
pub mod api;
pub mod task;
pub mod snapshot;
pub mod watcher;
pub mod reports;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{ManagementApi, VsphereApi};
pub use error::{VsphereError, VsphereErrorKind, VsphereResult};
pub use outcome::{OperationResult, OutcomeKind};
pub use service::{CustomVmRequest, InfraService, PlacementDefaults, WatchRequest};
pub use watcher::CancelFlag;
