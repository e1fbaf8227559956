pub mod ipc;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a Kubernetes service: namespace plus name.
///
/// The derived [`ServiceInfo::key`] string is the handle used in every
/// map and log line that refers to a managed forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub namespace: String,
    pub name: String,
}

impl ServiceInfo {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Map/log handle, `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The DNS names a service is reachable under inside the cluster.
    pub fn hostnames(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            format!("{}.{}", self.name, self.namespace),
            format!("{}.{}.svc", self.name, self.namespace),
            format!("{}.{}.svc.cluster.local", self.name, self.namespace),
        ]
    }
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a backing pod. Same key shape as [`ServiceInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
}

impl PodInfo {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for PodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One remote port paired with the local port it is exposed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub remote: u16,
    pub local: u16,
}

impl PortPair {
    pub fn new(remote: u16, local: u16) -> Self {
        Self { remote, local }
    }

    /// Same port on both ends.
    pub fn symmetric(port: u16) -> Self {
        Self {
            remote: port,
            local: port,
        }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote, self.local)
    }
}

impl FromStr for PortPair {
    type Err = String;

    /// Parses `remote:local`, or a bare port used for both ends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| format!("invalid port number: {p}"))
        };
        match s.split_once(':') {
            Some((remote, local)) => Ok(Self {
                remote: parse(remote)?,
                local: parse(local)?,
            }),
            None => Ok(Self::symmetric(parse(s)?)),
        }
    }
}

/// Lifecycle state of a managed port-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortForwardStatus {
    /// Tunnel is open and serving.
    Running,
    /// No backing endpoint was found; resources are parked until the
    /// next create or delete.
    Waiting,
    /// A recreate request is in flight for this forward.
    Recreating,
}

impl fmt::Display for PortForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortForwardStatus::Running => write!(f, "running"),
            PortForwardStatus::Waiting => write!(f, "waiting"),
            PortForwardStatus::Recreating => write!(f, "recreating"),
        }
    }
}
