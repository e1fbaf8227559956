use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use svclocal_common::ipc::ForwardEntry;
use svclocal_common::{PodInfo, PortForwardStatus, PortPair, ServiceInfo};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alias;
use crate::error::ProxyError;
use crate::hosts::HostsFile;
use crate::ippool::IpPool;
use crate::tunnel::{TunnelConnector, TunnelHandle};

const REQUEST_QUEUE_CAPACITY: usize = 1024;
const STABLE_AFTER: Duration = Duration::from_secs(2);

/// Options for the port-forward worker.
#[derive(Debug, Clone)]
pub struct ProxyOpts {
    /// Loopback CIDR the IP pool carves addresses from.
    pub ip_cidr: String,
    /// Hosts file to manage; `None` selects the platform default.
    pub hosts_path: Option<PathBuf>,
}

impl Default for ProxyOpts {
    fn default() -> Self {
        Self {
            ip_cidr: "127.0.0.0/8".to_string(),
            hosts_path: None,
        }
    }
}

/// The two request shapes the worker accepts.
#[derive(Debug, Clone)]
pub enum PortForwardRequest {
    Create(CreatePortForwardRequest),
    Delete(DeletePortForwardRequest),
}

#[derive(Debug, Clone)]
pub struct CreatePortForwardRequest {
    pub service: ServiceInfo,
    pub hostnames: Vec<String>,
    pub ports: Vec<PortPair>,
    /// Pre-resolved backing pod; the endpoint resolver is consulted when
    /// absent.
    pub endpoint: Option<PodInfo>,
    /// Replace an existing forward for this service instead of failing.
    pub recreate: bool,
    pub recreate_reason: String,
}

#[derive(Debug, Clone)]
pub struct DeletePortForwardRequest {
    pub service: ServiceInfo,
}

/// The worker's record for one active or pending forward. Mutated only
/// from the worker loop.
struct PortForwardConnection {
    service: ServiceInfo,
    pod: Option<PodInfo>,
    ip: Option<Ipv4Addr>,
    ports: Vec<PortPair>,
    hostnames: Vec<String>,
    status: PortForwardStatus,
    status_reason: String,
    tunnel: Option<CancellationToken>,
}

/// Last-activity clock shared between the worker (writer) and readiness
/// probes (readers).
#[derive(Clone)]
pub struct Stability(Arc<Mutex<Instant>>);

impl Stability {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap() = Instant::now();
    }

    /// True once the worker has gone two seconds without doing
    /// meaningful work, i.e. the startup queue has drained.
    pub fn is_stable(&self) -> bool {
        self.0.lock().unwrap().elapsed() >= STABLE_AFTER
    }
}

/// Read-only mirror of the active map for observers (the IPC `list`
/// handler). The worker is the only writer; the map itself stays
/// single-threaded.
#[derive(Clone, Default)]
pub struct StatusBoard(Arc<Mutex<HashMap<String, ForwardEntry>>>);

impl StatusBoard {
    pub fn snapshot(&self) -> Vec<ForwardEntry> {
        let mut entries: Vec<ForwardEntry> = self.0.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        entries
    }

    fn publish(&self, conn: &PortForwardConnection) {
        let entry = ForwardEntry {
            namespace: conn.service.namespace.clone(),
            name: conn.service.name.clone(),
            status: conn.status,
            status_reason: conn.status_reason.clone(),
            endpoint: conn.pod.as_ref().map(PodInfo::key).unwrap_or_default(),
            ip: conn.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            ports: conn.ports.iter().map(PortPair::to_string).collect(),
            hostnames: conn.hostnames.clone(),
        };
        self.0.lock().unwrap().insert(conn.service.key(), entry);
    }

    fn remove(&self, key: &str) {
        self.0.lock().unwrap().remove(key);
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Handle returned by [`PortForwarder::spawn`]: the request sender, the
/// readiness predicate, the observer board, and the done channel.
pub struct PortForwarder {
    requests: mpsc::Sender<PortForwardRequest>,
    done: oneshot::Receiver<()>,
    stability: Stability,
    board: StatusBoard,
}

impl PortForwarder {
    /// Builds the IP pool and hosts editor, then spawns the worker loop.
    /// Construction fails on an invalid CIDR or an unreadable hosts file.
    pub fn spawn(
        connector: Arc<dyn TunnelConnector>,
        opts: &ProxyOpts,
        shutdown: CancellationToken,
    ) -> Result<Self, ProxyError> {
        let pool = IpPool::new(&opts.ip_cidr)?;
        let hosts = match &opts.hosts_path {
            Some(path) => HostsFile::load(path)?,
            None => HostsFile::system()?,
        };

        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let stability = Stability::new();
        let board = StatusBoard::default();

        let worker = Worker {
            connector,
            pool,
            hosts,
            req_tx: req_tx.clone(),
            req_rx,
            shutdown,
            forwards: HashMap::new(),
            stability: stability.clone(),
            board: board.clone(),
        };
        tokio::spawn(worker.run(done_tx));

        Ok(Self {
            requests: req_tx,
            done: done_rx,
            stability,
            board,
        })
    }

    /// Sender half of the bounded request inbox.
    pub fn requests(&self) -> mpsc::Sender<PortForwardRequest> {
        self.requests.clone()
    }

    pub fn is_stable(&self) -> bool {
        self.stability.is_stable()
    }

    pub fn snapshot(&self) -> Vec<ForwardEntry> {
        self.board.snapshot()
    }

    /// Shareable handles for observers such as the IPC server.
    pub fn stability(&self) -> Stability {
        self.stability.clone()
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Resolves once shutdown has released every managed resource.
    pub async fn done(&mut self) {
        let _ = (&mut self.done).await;
    }
}

struct Worker {
    connector: Arc<dyn TunnelConnector>,
    pool: IpPool,
    hosts: HostsFile,
    req_tx: mpsc::Sender<PortForwardRequest>,
    req_rx: mpsc::Receiver<PortForwardRequest>,
    shutdown: CancellationToken,
    forwards: HashMap<String, PortForwardConnection>,
    stability: Stability,
    board: StatusBoard,
}

impl Worker {
    async fn run(mut self, done: oneshot::Sender<()>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                req = self.req_rx.recv() => match req {
                    Some(req) => self.handle(req).await,
                    None => break,
                },
            }
        }

        self.drain().await;
        let _ = done.send(());
    }

    async fn handle(&mut self, req: PortForwardRequest) {
        let (service, result) = match req {
            PortForwardRequest::Create(req) => {
                (req.service.clone(), self.create_port_forward(req).await)
            }
            PortForwardRequest::Delete(req) => {
                (req.service.clone(), self.delete_port_forward(&req).await)
            }
        };

        if let Err(err) = result {
            error!(service = %service.key(), "request failed: {err}");
        }
    }

    /// Shutdown path: stop every record. The inbox is not drained once
    /// cancellation has been observed.
    async fn drain(&mut self) {
        let keys: Vec<String> = self.forwards.keys().cloned().collect();
        for key in keys {
            if let Some(mut conn) = self.forwards.remove(&key) {
                if let Err(err) = self.stop_port_forward(&mut conn).await {
                    warn!(service = %key, "failed to clean up port-forward: {err}");
                }
            }
        }
        self.board.clear();
    }

    async fn create_port_forward(&mut self, req: CreatePortForwardRequest) -> Result<(), ProxyError> {
        let key = req.service.key();
        let exists = self.forwards.contains_key(&key);

        if exists && !req.recreate {
            return Err(ProxyError::AlreadyManaged(key));
        }
        // The forward can have been deleted while its recreate request sat
        // in the queue; treat that as settled rather than resurrect it.
        if req.recreate && !exists {
            debug!(service = %key, "skipping recreate for unmanaged service");
            return Ok(());
        }

        self.stability.touch();

        if req.recreate {
            info!(service = %key, reason = %req.recreate_reason, "recreating port-forward");
            if let Some(mut old) = self.forwards.remove(&key) {
                old.status = PortForwardStatus::Recreating;
                old.status_reason = req.recreate_reason.clone();
                self.board.publish(&old);
                if let Err(err) = self.stop_port_forward(&mut old).await {
                    warn!(service = %key, "failed to clean up previous port-forward: {err}");
                }
                self.forwards.insert(key.clone(), old);
            }
        }

        let mut conn = PortForwardConnection {
            service: req.service.clone(),
            pod: None,
            ip: None,
            ports: req.ports.clone(),
            hostnames: req.hostnames.clone(),
            status: PortForwardStatus::Running,
            status_reason: String::new(),
            tunnel: None,
        };

        match self.provision(&mut conn, &req).await {
            Ok(()) => {
                self.board.publish(&conn);
                self.forwards.insert(key, conn);
                Ok(())
            }
            Err(err) => {
                // Release whatever the partial create acquired.
                if let Err(cleanup) = self.stop_port_forward(&mut conn).await {
                    warn!(service = %key, "failed to clean up failed tunnel: {cleanup}");
                }
                Err(err)
            }
        }
    }

    /// Acquires the IP, alias, and hosts entries, then opens the tunnel.
    /// On the no-endpoint path the record is demoted to Waiting with its
    /// resources released; that is not a failure.
    async fn provision(
        &mut self,
        conn: &mut PortForwardConnection,
        req: &CreatePortForwardRequest,
    ) -> Result<(), ProxyError> {
        let ip = self.pool.acquire()?;
        conn.ip = Some(ip);

        if alias::active() {
            alias::add(ip).await?;
        }

        self.hosts.add_hosts(IpAddr::V4(ip), &conn.hostnames);
        self.hosts.save()?;

        let pod = match &req.endpoint {
            Some(pod) => Some(pod.clone()),
            None => match self.connector.resolve_endpoint(&req.service).await {
                Ok(pod) => Some(pod),
                Err(err) => {
                    debug!(service = %conn.service, "endpoint lookup failed: {err}");
                    None
                }
            },
        };

        let Some(pod) = pod else {
            warn!(service = %conn.service, "skipping tunnel creation; no endpoint found");
            conn.status = PortForwardStatus::Waiting;
            conn.status_reason = "No endpoints were found.".to_string();
            return self.stop_port_forward(conn).await;
        };

        info!(service = %conn.service, endpoint = %pod, ip = %ip, "creating tunnel");
        let handle = self.connector.open_tunnel(&pod, ip, &conn.ports).await?;
        conn.pod = Some(pod);
        conn.tunnel = Some(handle.stopper());

        self.spawn_monitor(handle, req);

        Ok(())
    }

    /// Watches one tunnel until it exits. A stream failure turns into a
    /// recreate request unless the daemon is already shutting down; a
    /// close requested through the stopper is final.
    fn spawn_monitor(&self, handle: TunnelHandle, req: &CreatePortForwardRequest) {
        let service = req.service.clone();
        let hostnames = req.hostnames.clone();
        let ports = req.ports.clone();
        let requests = self.req_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let Err(err) = handle.wait().await else {
                return;
            };
            if shutdown.is_cancelled() {
                return;
            }

            let _ = requests
                .send(PortForwardRequest::Create(CreatePortForwardRequest {
                    service,
                    hostnames,
                    ports,
                    endpoint: None,
                    recreate: true,
                    recreate_reason: err.to_string(),
                }))
                .await;
        });
    }

    async fn delete_port_forward(&mut self, req: &DeletePortForwardRequest) -> Result<(), ProxyError> {
        let key = req.service.key();

        // Nothing to do for forwards we do not manage.
        let Some(mut conn) = self.forwards.remove(&key) else {
            return Ok(());
        };

        self.stability.touch();

        if let Err(err) = self.stop_port_forward(&mut conn).await {
            warn!(service = %key, "failed to clean up port-forward: {err}");
        }
        self.board.remove(&key);

        info!(service = %key, "stopped port-forward");

        Ok(())
    }

    /// Releases a record's resources in reverse order of acquisition:
    /// tunnel, then alias, pool address, and hosts entries. Errors are
    /// collected so a failing step never skips the ones after it, and the
    /// hosts write is synchronous so shutdown cannot cancel it halfway.
    async fn stop_port_forward(
        &mut self,
        conn: &mut PortForwardConnection,
    ) -> Result<(), ProxyError> {
        if let Some(tunnel) = conn.tunnel.take() {
            tunnel.cancel();
        }

        let mut errs: Vec<String> = Vec::new();

        if let Some(ip) = conn.ip.take() {
            if alias::active() {
                if let Err(err) = alias::remove(ip).await {
                    errs.push(format!("failed to release ip alias: {err}"));
                }
            }

            if let Err(err) = self.pool.release(ip) {
                errs.push(format!("failed to release ip address: {err}"));
            }

            self.hosts.remove_address(IpAddr::V4(ip));
            if let Err(err) = self.hosts.save() {
                errs.push(format!("failed to save hosts file: {err}"));
            }
        }

        if !errs.is_empty() {
            return Err(ProxyError::Cleanup(errs));
        }

        Ok(())
    }
}
