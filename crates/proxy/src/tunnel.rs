use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use svclocal_common::{PodInfo, PortPair, ServiceInfo};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::endpoints;
use crate::error::ProxyError;

/// How the worker reaches the cluster. The production implementation is
/// [`KubeConnector`]; tests substitute an in-memory fake.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Returns the first ready backing pod for `service`, or
    /// [`ProxyError::NoEndpoints`].
    async fn resolve_endpoint(&self, service: &ServiceInfo) -> Result<PodInfo, ProxyError>;

    /// Opens a tunnel bound to `ip` for `ports` against `pod`.
    async fn open_tunnel(
        &self,
        pod: &PodInfo,
        ip: Ipv4Addr,
        ports: &[PortPair],
    ) -> Result<TunnelHandle, ProxyError>;
}

/// The worker's grip on a live tunnel: a stop token plus an exit report.
pub struct TunnelHandle {
    stopper: CancellationToken,
    exit: oneshot::Receiver<Result<(), ProxyError>>,
}

impl TunnelHandle {
    pub fn new(stopper: CancellationToken, exit: oneshot::Receiver<Result<(), ProxyError>>) -> Self {
        Self { stopper, exit }
    }

    /// Token that closes the tunnel when cancelled.
    pub fn stopper(&self) -> CancellationToken {
        self.stopper.clone()
    }

    /// Resolves when the tunnel exits: `Ok` for a close requested through
    /// the stopper, `Err` when the stream failed.
    pub async fn wait(self) -> Result<(), ProxyError> {
        match self.exit.await {
            Ok(result) => result,
            // Reporting side dropped without a verdict; treat as closed.
            Err(_) => Ok(()),
        }
    }
}

pub struct KubeConnector {
    client: Client,
}

impl KubeConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TunnelConnector for KubeConnector {
    async fn resolve_endpoint(&self, service: &ServiceInfo) -> Result<PodInfo, ProxyError> {
        endpoints::pod_for_service(&self.client, service).await
    }

    async fn open_tunnel(
        &self,
        pod: &PodInfo,
        ip: Ipv4Addr,
        ports: &[PortPair],
    ) -> Result<TunnelHandle, ProxyError> {
        let tunnel = Tunnel::new(self.client.clone(), pod.clone(), ip, ports.to_vec());
        let active = tunnel.open().await?;
        let stopper = active.stopper();

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = exit_tx.send(active.forward_ports().await);
        });

        Ok(TunnelHandle::new(stopper, exit_rx))
    }
}

/// One tunnel: a set of local listeners on a dedicated loopback IP, each
/// bridging accepted connections to the pod's port-forward subresource.
pub struct Tunnel {
    client: Client,
    pod: PodInfo,
    bind_ip: Ipv4Addr,
    ports: Vec<PortPair>,
}

impl Tunnel {
    pub fn new(client: Client, pod: PodInfo, bind_ip: Ipv4Addr, ports: Vec<PortPair>) -> Self {
        Self {
            client,
            pod,
            bind_ip,
            ports,
        }
    }

    /// Verifies the pod's port-forward subresource is reachable and binds
    /// every local port. Any failure here leaves nothing running.
    pub async fn open(self) -> Result<ActiveTunnel, ProxyError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.pod.namespace);

        let remote_ports: Vec<u16> = self.ports.iter().map(|p| p.remote).collect();
        let probe = api
            .portforward(&self.pod.name, &remote_ports)
            .await
            .map_err(|e| ProxyError::Stream(format!("port-forward to {}: {e}", self.pod)))?;
        drop(probe);

        let mut listeners = Vec::with_capacity(self.ports.len());
        for pair in &self.ports {
            let addr = SocketAddr::new(IpAddr::V4(self.bind_ip), pair.local);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| ProxyError::Stream(format!("failed to bind {addr}: {e}")))?;
            listeners.push((listener, *pair));
        }

        Ok(ActiveTunnel {
            api,
            pod: self.pod,
            listeners,
            cancel: CancellationToken::new(),
        })
    }
}

pub struct ActiveTunnel {
    api: Api<Pod>,
    pod: PodInfo,
    listeners: Vec<(TcpListener, PortPair)>,
    cancel: CancellationToken,
}

impl ActiveTunnel {
    pub fn stopper(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Forwards bytes until the stop token fires (`Ok`) or the stream
    /// fails (`Err` with the last error). No recreation happens here; the
    /// worker decides what an exit means.
    pub async fn forward_ports(self) -> Result<(), ProxyError> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ProxyError>(1);

        let mut accept_tasks = Vec::with_capacity(self.listeners.len());
        for (listener, pair) in self.listeners {
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                pair,
                self.api.clone(),
                self.pod.clone(),
                fatal_tx.clone(),
                self.cancel.clone(),
            )));
        }
        drop(fatal_tx);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            fatal = fatal_rx.recv() => match fatal {
                Some(err) => Err(err),
                None => Ok(()),
            },
        };

        self.cancel.cancel();
        for task in accept_tasks {
            task.abort();
        }

        result
    }
}

async fn accept_loop(
    listener: TcpListener,
    pair: PortPair,
    api: Api<Pod>,
    pod: PodInfo,
    fatal: mpsc::Sender<ProxyError>,
    cancel: CancellationToken,
) {
    loop {
        let (local, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    let _ = fatal
                        .try_send(ProxyError::Stream(format!(
                            "accept failed on local port {}: {e}",
                            pair.local
                        )));
                    return;
                }
            },
        };
        debug!(%peer, port = pair.local, "accepted tunnel connection");

        // One port-forward stream per accepted connection; losing the pod
        // surfaces here and tears the whole tunnel down.
        let mut forwarder = match api.portforward(&pod.name, &[pair.remote]).await {
            Ok(fw) => fw,
            Err(e) => {
                let _ = fatal.try_send(ProxyError::Stream(format!(
                    "port-forward to {}:{}: {e}",
                    pod, pair.remote
                )));
                return;
            }
        };
        let Some(mut upstream) = forwarder.take_stream(pair.remote) else {
            let _ = fatal.try_send(ProxyError::Stream(format!(
                "no stream for remote port {}",
                pair.remote
            )));
            return;
        };

        let conn_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut local = local;
            tokio::select! {
                _ = conn_cancel.cancelled() => {}
                copied = tokio::io::copy_bidirectional(&mut local, &mut upstream) => match copied {
                    Ok((up, down)) => debug!(up, down, "tunnel connection closed"),
                    Err(e) => debug!("tunnel connection error: {e}"),
                }
            }
            drop(upstream);
            let _ = forwarder.join().await;
        });
    }
}
