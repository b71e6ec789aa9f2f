//! crmgate MCP server.
//!
//! Exposes the CRM tool catalog to AI agents over the Model Context Protocol.
//! Every tool runs through the governed gateway: credential resolution, per
//! session quota admission, bounded reads, and confirmed, deduplicated writes.
//!
//! ## Architecture
//!
//! - `CrmMcpServer`: rmcp handler, one per agent connection
//! - `service`: tool bodies, returning the standard response envelope
//! - `dispatch`: name-based invocation over raw JSON arguments
//! - `bootstrap`: config to running service

pub mod bootstrap;
pub mod dispatch;
pub mod params;
mod server;
pub mod service;
pub mod tools;
mod validation;

pub use dispatch::{dispatch, ToolCallRequest};
pub use server::CrmMcpServer;
pub use service::{CrmToolService, SweepReport};
pub use tools::{is_known_tool, is_write_tool, ALL_TOOL_NAMES, TOTAL_TOOLS, WRITE_TOOL_NAMES};
