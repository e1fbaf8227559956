//! End-to-end tests for the port-forward worker against an in-memory
//! tunnel connector and a throwaway hosts file.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use svclocal_common::{PodInfo, PortForwardStatus, PortPair, ServiceInfo};
use svclocal_proxy::{
    CreatePortForwardRequest, DeletePortForwardRequest, PortForwardRequest, PortForwarder,
    ProxyError, ProxyOpts, TunnelConnector, TunnelHandle,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const HOSTS_SEED: &str = "127.0.0.1 localhost\n";

struct FakeTunnel {
    pod: PodInfo,
    ip: Ipv4Addr,
    ports: Vec<PortPair>,
    fail: Option<oneshot::Sender<String>>,
}

/// Connector whose endpoints and tunnel exits are driven by the test.
#[derive(Default)]
struct FakeConnector {
    endpoint: Mutex<Option<PodInfo>>,
    tunnels: Mutex<Vec<FakeTunnel>>,
}

impl FakeConnector {
    fn set_endpoint(&self, pod: Option<PodInfo>) {
        *self.endpoint.lock().unwrap() = pod;
    }

    fn tunnel_count(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }

    fn tunnel_ip(&self, index: usize) -> Ipv4Addr {
        self.tunnels.lock().unwrap()[index].ip
    }

    fn tunnel_pod(&self, index: usize) -> PodInfo {
        self.tunnels.lock().unwrap()[index].pod.clone()
    }

    fn tunnel_ports(&self, index: usize) -> Vec<PortPair> {
        self.tunnels.lock().unwrap()[index].ports.clone()
    }

    /// Simulates a stream failure on the index-th opened tunnel.
    fn fail_tunnel(&self, index: usize, reason: &str) {
        let sender = self.tunnels.lock().unwrap()[index]
            .fail
            .take()
            .expect("tunnel already failed");
        let _ = sender.send(reason.to_string());
    }
}

#[async_trait]
impl TunnelConnector for FakeConnector {
    async fn resolve_endpoint(&self, _service: &ServiceInfo) -> Result<PodInfo, ProxyError> {
        self.endpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or(ProxyError::NoEndpoints)
    }

    async fn open_tunnel(
        &self,
        pod: &PodInfo,
        ip: Ipv4Addr,
        ports: &[PortPair],
    ) -> Result<TunnelHandle, ProxyError> {
        let stopper = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (fail_tx, fail_rx) = oneshot::channel::<String>();

        let tunnel_stopper = stopper.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tunnel_stopper.cancelled() => {
                    let _ = exit_tx.send(Ok(()));
                }
                reason = fail_rx => {
                    let result = match reason {
                        Ok(reason) => Err(ProxyError::Stream(reason)),
                        Err(_) => Ok(()),
                    };
                    let _ = exit_tx.send(result);
                }
            }
        });

        self.tunnels.lock().unwrap().push(FakeTunnel {
            pod: pod.clone(),
            ip,
            ports: ports.to_vec(),
            fail: Some(fail_tx),
        });

        Ok(TunnelHandle::new(stopper, exit_rx))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    hosts_path: PathBuf,
    connector: Arc<FakeConnector>,
    forwarder: PortForwarder,
    shutdown: CancellationToken,
}

impl Harness {
    fn spawn() -> Self {
        // Keep ifconfig out of test runs on platforms that alias.
        std::env::set_var("DISABLE_LOOPBACK_ALIAS", "1");

        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, HOSTS_SEED).unwrap();

        let connector = Arc::new(FakeConnector::default());
        let shutdown = CancellationToken::new();
        let opts = ProxyOpts {
            ip_cidr: "127.0.0.0/8".to_string(),
            hosts_path: Some(hosts_path.clone()),
        };
        let forwarder =
            PortForwarder::spawn(connector.clone(), &opts, shutdown.clone()).unwrap();

        Self {
            _dir: dir,
            hosts_path,
            connector,
            forwarder,
            shutdown,
        }
    }

    async fn create(&self, service: &ServiceInfo, endpoint: Option<PodInfo>, recreate: bool) {
        self.forwarder
            .requests()
            .send(PortForwardRequest::Create(CreatePortForwardRequest {
                service: service.clone(),
                hostnames: service.hostnames(),
                ports: vec![PortPair::symmetric(8080)],
                endpoint,
                recreate,
                recreate_reason: String::new(),
            }))
            .await
            .unwrap();
    }

    async fn delete(&self, service: &ServiceInfo) {
        self.forwarder
            .requests()
            .send(PortForwardRequest::Delete(DeletePortForwardRequest {
                service: service.clone(),
            }))
            .await
            .unwrap();
    }

    fn hosts_content(&self) -> String {
        std::fs::read_to_string(&self.hosts_path).unwrap()
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn service() -> ServiceInfo {
    ServiceInfo::new("ns", "a")
}

fn pod(name: &str) -> PodInfo {
    PodInfo::new("ns", name)
}

#[tokio::test]
async fn create_runs_tunnel_and_publishes_hosts() {
    let h = Harness::spawn();
    let svc = service();

    h.create(&svc, Some(pod("pod-1")), false).await;
    wait_until("forward to be running", || {
        h.forwarder
            .snapshot()
            .iter()
            .any(|e| e.status == PortForwardStatus::Running)
    })
    .await;

    let entries = h.forwarder.snapshot();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!((entry.namespace.as_str(), entry.name.as_str()), ("ns", "a"));
    assert_eq!(entry.endpoint, "ns/pod-1");
    assert_eq!(entry.ports, vec!["8080:8080".to_string()]);

    let ip: Ipv4Addr = entry.ip.parse().unwrap();
    assert!(ip.is_loopback());
    assert_ne!(ip, Ipv4Addr::new(127, 0, 0, 1));

    assert_eq!(h.connector.tunnel_count(), 1);
    assert_eq!(h.connector.tunnel_ip(0), ip);
    assert_eq!(h.connector.tunnel_pod(0).key(), "ns/pod-1");
    assert_eq!(h.connector.tunnel_ports(0), vec![PortPair::symmetric(8080)]);

    let hosts = h.hosts_content();
    assert!(hosts.starts_with(HOSTS_SEED));
    assert!(hosts.contains(&format!("{ip}\ta a.ns a.ns.svc a.ns.svc.cluster.local")));
}

#[tokio::test]
async fn create_without_endpoints_parks_as_waiting() {
    let h = Harness::spawn();
    let svc = service();

    h.create(&svc, None, false).await;
    wait_until("forward to be waiting", || {
        h.forwarder
            .snapshot()
            .iter()
            .any(|e| e.status == PortForwardStatus::Waiting)
    })
    .await;

    let entry = &h.forwarder.snapshot()[0];
    assert_eq!(entry.status_reason, "No endpoints were found.");
    assert!(entry.ip.is_empty());
    assert!(entry.endpoint.is_empty());

    // No resources may be held while waiting.
    assert_eq!(h.hosts_content(), HOSTS_SEED);
    assert_eq!(h.connector.tunnel_count(), 0);

    // A recreate with a now-known endpoint promotes it to running.
    h.create(&svc, Some(pod("pod-1")), true).await;
    wait_until("forward to recover", || {
        h.forwarder
            .snapshot()
            .iter()
            .any(|e| e.status == PortForwardStatus::Running)
    })
    .await;

    let entry = &h.forwarder.snapshot()[0];
    assert!(!entry.ip.is_empty());
    assert_eq!(entry.endpoint, "ns/pod-1");
}

#[tokio::test]
async fn stream_failure_recreates_the_tunnel() {
    let h = Harness::spawn();
    let svc = service();

    // Recreates resolve through the endpoint source.
    h.connector.set_endpoint(Some(pod("pod-2")));

    h.create(&svc, Some(pod("pod-1")), false).await;
    wait_until("first tunnel", || h.connector.tunnel_count() == 1).await;

    h.connector.fail_tunnel(0, "stream closed");
    wait_until("replacement tunnel", || {
        h.connector.tunnel_count() == 2
            && h.forwarder
                .snapshot()
                .iter()
                .any(|e| e.status == PortForwardStatus::Running)
    })
    .await;

    let entries = h.forwarder.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].endpoint, "ns/pod-2");

    // Exactly one managed hosts line regardless of how many recreates ran.
    let hosts = h.hosts_content();
    assert_eq!(hosts.matches("a.ns.svc.cluster.local").count(), 1);
}

#[tokio::test]
async fn delete_releases_every_resource() {
    let h = Harness::spawn();
    let svc = service();

    h.create(&svc, Some(pod("pod-1")), false).await;
    wait_until("tunnel", || h.connector.tunnel_count() == 1).await;
    let first_ip = h.connector.tunnel_ip(0);

    h.delete(&svc).await;
    wait_until("forward removal", || h.forwarder.snapshot().is_empty()).await;
    assert_eq!(h.hosts_content(), HOSTS_SEED);

    // The stopper-driven exit must not resurrect the forward.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.forwarder.snapshot().is_empty());
    assert_eq!(h.connector.tunnel_count(), 1);

    // The pool got its address back: a fresh create reuses it.
    h.create(&svc, Some(pod("pod-1")), false).await;
    wait_until("second tunnel", || h.connector.tunnel_count() == 2).await;
    assert_eq!(h.connector.tunnel_ip(1), first_ip);
}

#[tokio::test]
async fn duplicate_create_leaves_the_record_alone() {
    let h = Harness::spawn();
    let svc = service();

    h.create(&svc, Some(pod("pod-1")), false).await;
    wait_until("tunnel", || h.connector.tunnel_count() == 1).await;
    let before = h.forwarder.snapshot();

    h.create(&svc, Some(pod("pod-9")), false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = h.forwarder.snapshot();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].ip, before[0].ip);
    assert_eq!(after[0].endpoint, "ns/pod-1");
    assert_eq!(h.connector.tunnel_count(), 1);
}

#[tokio::test]
async fn recreate_for_a_deleted_forward_is_a_no_op() {
    let h = Harness::spawn();
    let svc = service();

    h.create(&svc, Some(pod("pod-1")), false).await;
    wait_until("tunnel", || h.connector.tunnel_count() == 1).await;

    h.delete(&svc).await;
    wait_until("forward removal", || h.forwarder.snapshot().is_empty()).await;

    // A late tunnel-exit recreate that lost the race with the delete.
    h.create(&svc, Some(pod("pod-1")), true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.forwarder.snapshot().is_empty());
    assert_eq!(h.connector.tunnel_count(), 1);
    assert_eq!(h.hosts_content(), HOSTS_SEED);
}

#[tokio::test]
async fn shutdown_drains_the_active_map() {
    let mut h = Harness::spawn();
    let a = ServiceInfo::new("ns", "a");
    let b = ServiceInfo::new("ns", "b");

    h.create(&a, Some(pod("pod-1")), false).await;
    h.create(&b, Some(pod("pod-2")), false).await;
    wait_until("both tunnels", || h.connector.tunnel_count() == 2).await;

    h.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), h.forwarder.done())
        .await
        .expect("worker did not drain");

    assert!(h.forwarder.snapshot().is_empty());
    assert_eq!(h.hosts_content(), HOSTS_SEED);
}

#[tokio::test]
async fn stability_reports_quiescence() {
    let h = Harness::spawn();
    let svc = service();

    h.create(&svc, Some(pod("pod-1")), false).await;
    wait_until("tunnel", || h.connector.tunnel_count() == 1).await;
    assert!(!h.forwarder.is_stable());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(h.forwarder.is_stable());
}

#[tokio::test]
async fn invalid_cidr_fails_construction() {
    std::env::set_var("DISABLE_LOOPBACK_ALIAS", "1");
    let dir = tempfile::tempdir().unwrap();
    let hosts_path = dir.path().join("hosts");
    std::fs::write(&hosts_path, HOSTS_SEED).unwrap();

    let opts = ProxyOpts {
        ip_cidr: "not-a-cidr".to_string(),
        hosts_path: Some(hosts_path),
    };
    let result = PortForwarder::spawn(
        Arc::new(FakeConnector::default()),
        &opts,
        CancellationToken::new(),
    );
    assert!(matches!(result, Err(ProxyError::Config(_))));
}
