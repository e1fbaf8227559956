use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("ip pool exhausted")]
    PoolExhausted,

    #[error("ip {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    #[error("ip {0} is not allocated")]
    NotAllocated(Ipv4Addr),

    #[error("already have a port-forward for service {0}")]
    AlreadyManaged(String),

    #[error("no endpoints found")]
    NoEndpoints,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("loopback alias error: {0}")]
    Alias(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("tunnel stream error: {0}")]
    Stream(String),

    #[error("cleanup failed: {}", .0.join("; "))]
    Cleanup(Vec<String>),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
