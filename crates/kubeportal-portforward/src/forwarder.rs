use std::net::SocketAddr;
use std::sync::atomic::{
    AtomicBool,
    AtomicU64,
    AtomicUsize,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::Duration;

use chrono::{
    DateTime,
    Utc,
};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};
use uuid::Uuid;

use kubeportal_commons::ForwardDefinition;

use crate::error::ForwardError;
use crate::kube::cache::KubeCache;
use crate::pump::pump;

pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct ForwarderTokens {
    accept: CancellationToken,
    connections: CancellationToken,
}

/// The runtime half of one forward definition: a loopback listener, its
/// accept loop and the in-flight connection pumps.
///
/// The definition variant decides where accepted clients are relayed: a
/// fresh TCP connection for socket forwards, a pod port-forward channel
/// obtained through the shared [`KubeCache`] for kubernetes forwards.
pub struct Forwarder {
    definition: ForwardDefinition,
    kube_cache: Arc<KubeCache>,
    active: AtomicBool,
    bytes_transferred: Arc<AtomicU64>,
    connection_count: Arc<AtomicUsize>,
    started_at: StdMutex<Option<DateTime<Utc>>>,
    tokens: StdMutex<Option<ForwarderTokens>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    connections: Arc<DashMap<Uuid, JoinHandle<()>>>,
}

impl Forwarder {
    pub fn new(definition: ForwardDefinition, kube_cache: Arc<KubeCache>) -> Arc<Self> {
        Arc::new(Self {
            definition,
            kube_cache,
            active: AtomicBool::new(false),
            bytes_transferred: Arc::new(AtomicU64::new(0)),
            connection_count: Arc::new(AtomicUsize::new(0)),
            started_at: StdMutex::new(None),
            tokens: StdMutex::new(None),
            accept_task: StdMutex::new(None),
            connections: Arc::new(DashMap::new()),
        })
    }

    pub fn definition(&self) -> &ForwardDefinition {
        &self.definition
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    /// Binds `127.0.0.1:<localPort>` and launches the accept loop.
    ///
    /// A bind failure leaves the forwarder untouched; an address already
    /// in use is reported as its own error kind so the caller can apply
    /// the disable-and-persist policy.
    pub async fn start(self: Arc<Self>, parent: &CancellationToken) -> Result<(), ForwardError> {
        let port = self.definition.local_port();
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ForwardError::AddressInUse(port)
            } else {
                ForwardError::Bind { port, source: e }
            }
        })?;

        // Separate tokens: a stop cancels the accept loop first and gives
        // in-flight pumps a drain window, while daemon shutdown reaches
        // both directly.
        let accept_cancel = parent.child_token();
        let connection_cancel = parent.child_token();
        *self.tokens.lock().unwrap() = Some(ForwarderTokens {
            accept: accept_cancel.clone(),
            connections: connection_cancel.clone(),
        });
        *self.started_at.lock().unwrap() = Some(Utc::now());
        self.active.store(true, Ordering::SeqCst);

        info!(
            forward = %self.definition.name(),
            port,
            kind = self.definition.kind(),
            "forward listening on 127.0.0.1"
        );

        let forwarder = Arc::clone(&self);
        let task = tokio::spawn(async move {
            forwarder
                .accept_loop(listener, accept_cancel, connection_cancel)
                .await;
        });
        *self.accept_task.lock().unwrap() = Some(task);

        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>, listener: TcpListener, accept_cancel: CancellationToken,
        connection_cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => {
                    debug!(forward = %self.definition.name(), "accept loop cancelled");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((client, peer_addr)) => {
                        let connection_id = Uuid::new_v4();
                        debug!(
                            forward = %self.definition.name(),
                            %peer_addr,
                            %connection_id,
                            "accepted connection"
                        );

                        let cancel = connection_cancel.child_token();
                        let forwarder = Arc::clone(&self);
                        let handle = tokio::spawn(async move {
                            forwarder.connection_count.fetch_add(1, Ordering::SeqCst);
                            if let Err(e) = forwarder.handle_connection(client, cancel).await {
                                debug!(
                                    forward = %forwarder.definition.name(),
                                    %connection_id,
                                    error = %e,
                                    "connection closed with error"
                                );
                            }
                            forwarder.connection_count.fetch_sub(1, Ordering::SeqCst);
                            forwarder.connections.remove(&connection_id);
                        });
                        self.connections.insert(connection_id, handle);
                        self.reap_finished();
                    }
                    Err(e) => {
                        warn!(
                            forward = %self.definition.name(),
                            error = %e,
                            "failed to accept connection"
                        );
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self, client: TcpStream, cancel: CancellationToken,
    ) -> Result<(), ForwardError> {
        if let Err(e) = client.set_nodelay(true) {
            debug!(error = %e, "failed to set nodelay on client socket");
        }

        match &self.definition {
            ForwardDefinition::Socket(socket) => {
                let connect = TcpStream::connect((socket.remote_host.as_str(), socket.remote_port));
                let remote = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    connected = connect => connected.map_err(|e| ForwardError::RemoteUnreachable {
                        host: socket.remote_host.clone(),
                        port: socket.remote_port,
                        source: e,
                    })?,
                };
                if let Err(e) = remote.set_nodelay(true) {
                    debug!(error = %e, "failed to set nodelay on remote socket");
                }

                pump(client, remote, self.bytes_transferred.clone(), cancel).await
            }
            ForwardDefinition::Kubernetes(kubernetes) => {
                let api_client = self.kube_cache.get_client(&kubernetes.context).await?;
                let pods = self
                    .kube_cache
                    .get_pods_for_service(
                        &kubernetes.context,
                        &kubernetes.namespace,
                        &kubernetes.service,
                    )
                    .await?;

                // Deliberately the first pod of the snapshot: sticky
                // within a cache window, which keeps long-lived protocols
                // on one backend.
                let Some(pod) = pods.first() else {
                    return Err(ForwardError::NoRunningPods {
                        context: kubernetes.context.clone(),
                        namespace: kubernetes.namespace.clone(),
                        service: kubernetes.service.clone(),
                    });
                };

                let pod_api: Api<Pod> = Api::namespaced(api_client, &kubernetes.namespace);
                let mut port_forwarder = pod_api
                    .portforward(&pod.pod_name, &[kubernetes.service_port])
                    .await
                    .map_err(|e| {
                        ForwardError::Kubernetes(format!(
                            "portforward to pod '{}' failed: {e}",
                            pod.pod_name
                        ))
                    })?;
                let upstream = port_forwarder
                    .take_stream(kubernetes.service_port)
                    .ok_or_else(|| {
                        ForwardError::Kubernetes(format!(
                            "port {} not found in forwarder",
                            kubernetes.service_port
                        ))
                    })?;

                pump(client, upstream, self.bytes_transferred.clone(), cancel).await
            }
        }
    }

    /// Cancels the accept loop, then waits up to [`DRAIN_TIMEOUT`] for
    /// in-flight connections to finish before abandoning the rest.
    pub async fn stop(&self) {
        let tokens = self.tokens.lock().unwrap().take();
        let Some(tokens) = tokens else {
            self.active.store(false, Ordering::SeqCst);
            return;
        };

        tokens.accept.cancel();
        let accept_task = self.accept_task.lock().unwrap().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            self.reap_finished();
            if self.connections.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    forward = %self.definition.name(),
                    remaining = self.connections.len(),
                    "grace period elapsed, abandoning in-flight connections"
                );
                tokens.connections.cancel();
                let stragglers: Vec<Uuid> =
                    self.connections.iter().map(|entry| *entry.key()).collect();
                for connection_id in stragglers {
                    if let Some((_, mut handle)) = self.connections.remove(&connection_id) {
                        let joined =
                            tokio::time::timeout(Duration::from_millis(500), &mut handle).await;
                        if joined.is_err() {
                            handle.abort();
                        }
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        tokens.connections.cancel();
        *self.started_at.lock().unwrap() = None;
        self.active.store(false, Ordering::SeqCst);
        info!(forward = %self.definition.name(), "forward stopped");
    }

    fn reap_finished(&self) {
        self.connections.retain(|_, handle| !handle.is_finished());
    }
}
