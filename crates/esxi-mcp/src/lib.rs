//! # ESXi MCP protocol layer
//!
//! JSON-RPC 2.0 / MCP front end for [`esxi_vsphere::InfraService`].
//!
//! ## Modules
//!
//! - **protocol** — JSON-RPC message types, MCP constants, protocol errors
//! - **tools** — Tool table, input schemas and argument decoding
//! - **auth** — API-key gate and per-connection session state
//! - **server** — Method dispatcher with per-request cancellation
//! - **stdio** — Newline-delimited stdio transport

pub mod protocol;
pub mod tools;
pub mod auth;
pub mod server;
pub mod stdio;

pub use auth::{ApiKeyGate, Session};
pub use protocol::{McpError, RpcRequest, RpcResponse};
pub use server::McpServer;
