//! Core of the svclocal daemon: the port-forward worker and the
//! resources it coordinates (loopback IP pool, hosts-file section,
//! platform aliases, tunnels).

pub mod alias;
pub mod endpoints;
pub mod error;
pub mod hosts;
pub mod ippool;
pub mod tunnel;
pub mod worker;

pub use error::ProxyError;
pub use tunnel::{KubeConnector, TunnelConnector, TunnelHandle};
pub use worker::{
    CreatePortForwardRequest, DeletePortForwardRequest, PortForwardRequest, PortForwarder,
    ProxyOpts, Stability, StatusBoard,
};
