//! IPC protocol between the daemon and auxiliary commands.
//!
//! Newline-delimited JSON over TCP on 127.0.0.1. TCP is used instead of a
//! Unix socket so the same code path works on macOS, Linux, and Windows.

use serde::{Deserialize, Serialize};

use crate::PortForwardStatus;

/// Default port the daemon's IPC listener binds on localhost.
pub const DEFAULT_IPC_PORT: u16 = 43117;

/// Request from an auxiliary command to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// List all managed port-forwards and their statuses.
    List,
    /// Ask whether the worker has quiesced.
    Stable,
    /// Keepalive.
    Ping,
}

/// Response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Services { services: Vec<ForwardEntry> },
    Stable { stable: bool },
    Pong,
    Error { message: String },
}

/// Summary of one managed forward, as shown by `svclocal list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEntry {
    pub namespace: String,
    pub name: String,
    pub status: PortForwardStatus,
    pub status_reason: String,
    /// Backing pod key, empty while no endpoint is known.
    pub endpoint: String,
    /// Allocated loopback IP, empty while waiting.
    pub ip: String,
    /// `remote:local` pairs.
    pub ports: Vec<String>,
    pub hostnames: Vec<String>,
}
