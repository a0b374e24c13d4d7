//! # esxi-mcp-server
//!
//! Binary-side glue for the VMware MCP server:
//!
//! - **config** – JSON/YAML configuration file with environment overrides
//! - **logging** – `tracing` subscriber setup (text or JSON, file or stderr)
//! - **http** – axum transport for `POST /mcp` and `GET /health`
//!
//! The vSphere binding and coordination core live in `esxi-vsphere`; the
//! JSON-RPC dispatcher and stdio transport live in `esxi-mcp`.

pub mod config;
pub mod http;
pub mod logging;

pub use config::{ConfigError, LogFormat, ServerConfig};
