//! Portal — warm-process tool server
//! Keeps a tool environment resident in one long-lived local server so that
//! short-lived client invocations skip cold-start cost. Clients discover or
//! start the portal through filesystem sentinels, send their arguments over a
//! local socket, and relay the captured output and exit status.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tool;
pub mod transport;

pub use client::{PortalClient, PortalStatus};
pub use config::{parse_env_ref, resolve_env_vars, PortalConfig, ToolConfig, TransportKind};
pub use endpoint::{Endpoint, EndpointGuard, STARTING_LOCK_NAME, STOP_SENTINEL_NAME};
pub use error::{PortalError, Result, TOOL_NOT_FOUND_STATUS};
pub use protocol::{Request, Response};
pub use server::{PortalServer, PortalState, ServeSummary, StopReason};
pub use tool::{CommandTool, Tool, ToolRegistry};
