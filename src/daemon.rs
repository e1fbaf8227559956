use std::sync::Arc;

use anyhow::{Context as _, Result};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ListParams;
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use svclocal_common::{PortPair, ServiceInfo};
use svclocal_proxy::{
    CreatePortForwardRequest, KubeConnector, PortForwardRequest, PortForwarder, ProxyOpts,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ipc_server;

pub struct DaemonOptions {
    pub namespaces: Vec<String>,
    pub cidr: String,
    pub context: Option<String>,
    pub ipc_port: u16,
}

pub async fn run(opts: DaemonOptions) -> Result<()> {
    let client = new_client(opts.context.as_deref())
        .await
        .context("failed to connect to Kubernetes; check your kubeconfig")?;

    let shutdown = CancellationToken::new();
    let proxy_opts = ProxyOpts {
        ip_cidr: opts.cidr.clone(),
        hosts_path: None,
    };
    let mut forwarder = PortForwarder::spawn(
        Arc::new(KubeConnector::new(client.clone())),
        &proxy_opts,
        shutdown.clone(),
    )
    .context("failed to start port-forward worker")?;

    seed_forwards(&client, &opts.namespaces, &forwarder).await?;

    let board = forwarder.board();
    let stability = forwarder.stability();
    let ipc_shutdown = shutdown.clone();
    let ipc = tokio::spawn(async move {
        if let Err(e) = ipc_server::serve(opts.ipc_port, board, stability, ipc_shutdown).await {
            tracing::error!("ipc server error: {e:#}");
        }
    });

    info!("svclocal is running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down; releasing forwards");
    shutdown.cancel();
    forwarder.done().await;
    ipc.abort();

    Ok(())
}

async fn new_client(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(context) => {
            Config::from_kubeconfig(&KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            })
            .await?
        }
        None => Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

/// Lists services in the selected namespaces and asks the worker to
/// forward each of them. The worker resolves endpoints itself, so
/// services without ready pods simply park as waiting.
async fn seed_forwards(
    client: &Client,
    namespaces: &[String],
    forwarder: &PortForwarder,
) -> Result<()> {
    let requests = forwarder.requests();

    for namespace in namespaces {
        let api: Api<Service> = Api::namespaced(client.clone(), namespace);
        let services = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list services in namespace {namespace}"))?;

        for service in services {
            let Some(name) = service.metadata.name.clone() else {
                continue;
            };
            let info = ServiceInfo::new(namespace.clone(), name);

            let ports = service_port_pairs(&info, &service);
            if ports.is_empty() {
                warn!(service = %info, "skipping service with no forwardable TCP ports");
                continue;
            }

            info!(service = %info, "requesting port-forward");
            let request = PortForwardRequest::Create(CreatePortForwardRequest {
                hostnames: info.hostnames(),
                service: info,
                ports,
                endpoint: None,
                recreate: false,
                recreate_reason: String::new(),
            });
            if requests.send(request).await.is_err() {
                // Worker already shut down; nothing more to seed.
                return Ok(());
            }
        }
    }

    Ok(())
}

fn service_port_pairs(info: &ServiceInfo, service: &Service) -> Vec<PortPair> {
    let Some(ports) = service.spec.as_ref().and_then(|s| s.ports.as_ref()) else {
        return Vec::new();
    };

    let mut pairs = Vec::new();
    for port in ports {
        let protocol = port.protocol.as_deref().unwrap_or("TCP");
        if !protocol.eq_ignore_ascii_case("tcp") {
            warn!(service = %info, port = port.port, protocol, "skipping non-TCP service port");
            continue;
        }

        let Ok(local) = u16::try_from(port.port) else {
            continue;
        };
        let remote = match &port.target_port {
            Some(IntOrString::Int(target)) => u16::try_from(*target).unwrap_or(local),
            // Named target ports would need the pod spec to resolve; the
            // service port is the best stand-in.
            Some(IntOrString::String(_)) | None => local,
        };
        pairs.push(PortPair { remote, local });
    }
    pairs
}
