use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CREATE_ACCESS, GET_ACCESS, namespaced};
use crate::error::{EngineError, EngineResult};
use crate::forwarders::{Forwarder, forward_id};
use crate::gvr::{Gvr, Selector};
use crate::port::{self, PortTunnel};
use crate::resources::{decode, pod_phase};
use crate::watch::Factory;

const RUNNING: &str = "Running";

/// Outcome of tunnel work that finished off the application loop.
pub enum ForwardEvent {
    Started(Arc<PortForwarder>),
    Failed {
        path: String,
        tunnel: PortTunnel,
        error: EngineError,
    },
    /// The serving worker exited, either on request or because the listener
    /// failed.
    Closed {
        session: Arc<dyn Forwarder>,
        error: Option<String>,
    },
}

/// One local listener relayed to a pod port. Every accepted connection gets
/// its own stream over the pod's `portforward` sub-resource.
pub struct PortForwarder {
    path: String,
    tunnel: PortTunnel,
    age: DateTime<Utc>,
    active: AtomicBool,
    stop: CancellationToken,
    ready: watch::Sender<bool>,
}

impl PortForwarder {
    pub(crate) fn new(path: &str, tunnel: PortTunnel, parent: &CancellationToken) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            path: path.to_string(),
            tunnel,
            age: Utc::now(),
            active: AtomicBool::new(false),
            stop: parent.child_token(),
            ready,
        }
    }

    /// Flips to `true` once the local listener accepts connections.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    fn mark_active(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.ready.send_replace(true);
    }

    /// Opens a tunnel to `path` (`namespace/pod`). The session is returned
    /// serving; registering it is left to the caller.
    pub async fn start(
        factory: &Factory,
        path: &str,
        tunnel: PortTunnel,
        parent: &CancellationToken,
        events: mpsc::UnboundedSender<ForwardEvent>,
    ) -> EngineResult<Arc<Self>> {
        let id = forward_id(path, &tunnel.container, &tunnel.port_map());
        if factory
            .forwarder_for(&id)
            .is_some_and(|existing| existing.active())
        {
            return Err(EngineError::AlreadyActive(id));
        }

        let (namespace, name) = namespaced(path);
        let pods = Gvr::pods();
        if !factory.client().can_i(&namespace, &pods, &GET_ACCESS).await? {
            return Err(EngineError::access_denied(&namespace, &pods, &GET_ACCESS));
        }
        let object = factory
            .get(&pods, path, true, &Selector::everything())
            .await?;
        let pod: Pod = decode(&object)?;
        let phase = pod_phase(&pod);
        if phase != RUNNING {
            return Err(EngineError::NotRunning {
                path: path.to_string(),
                phase,
            });
        }

        let subresource = pods.with_subresource("portforward");
        if !factory
            .client()
            .can_i(&namespace, &subresource, &CREATE_ACCESS)
            .await?
        {
            return Err(EngineError::access_denied(
                &namespace,
                &subresource,
                &CREATE_ACCESS,
            ));
        }

        port::probe(&tunnel)?;

        let api: Api<Pod> = Api::namespaced(factory.client().dial()?, &namespace);
        let handshake = api
            .portforward(&name, &[tunnel.container_port])
            .await
            .map_err(|error| EngineError::DialFailure {
                path: path.to_string(),
                reason: error.to_string(),
            })?;
        handshake.abort();
        let _ = handshake.join().await;

        let listener = TcpListener::bind((tunnel.address.as_str(), tunnel.local_port))
            .await
            .map_err(|source| EngineError::PortUnavailable {
                address: tunnel.address.clone(),
                port: tunnel.local_port,
                source,
            })?;

        let session = Arc::new(Self::new(path, tunnel, parent));
        session.mark_active();
        info!(
            path,
            ports = session.port_map(),
            address = session.address(),
            "port-forward started"
        );

        let worker = Arc::clone(&session);
        tokio::spawn(async move {
            worker.serve(listener, api, name, events).await;
        });
        Ok(session)
    }

    async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        api: Api<Pod>,
        pod: String,
        events: mpsc::UnboundedSender<ForwardEvent>,
    ) {
        let error = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break None,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = Relay {
                            api: api.clone(),
                            pod: pod.clone(),
                            port: self.tunnel.container_port,
                            stop: self.stop.child_token(),
                        };
                        let path = self.path.clone();
                        tokio::spawn(async move {
                            if let Err(error) = relay.run(stream, peer).await {
                                warn!(path, %peer, "port-forward connection failed: {error}");
                            }
                        });
                    }
                    Err(error) => break Some(error.to_string()),
                },
            }
        };

        self.active.store(false, Ordering::SeqCst);
        self.ready.send_replace(false);
        debug!(path = self.path, ports = self.port_map(), "port-forward worker exited");
        let session: Arc<dyn Forwarder> = self;
        let _ = events.send(ForwardEvent::Closed { session, error });
    }
}

struct Relay {
    api: Api<Pod>,
    pod: String,
    port: u16,
    stop: CancellationToken,
}

impl Relay {
    async fn run(self, mut stream: TcpStream, peer: SocketAddr) -> EngineResult<()> {
        let failure = |reason: String| EngineError::DialFailure {
            path: self.pod.clone(),
            reason,
        };
        let mut forwarder = self
            .api
            .portforward(&self.pod, &[self.port])
            .await
            .map_err(|error| failure(error.to_string()))?;
        let mut upstream = forwarder
            .take_stream(self.port)
            .ok_or_else(|| failure(format!("no stream for port {}", self.port)))?;

        debug!(pod = self.pod, %peer, "relaying connection");
        let copied = tokio::select! {
            _ = self.stop.cancelled() => Ok(()),
            copied = tokio::io::copy_bidirectional(&mut stream, &mut upstream) => copied.map(drop),
        };
        drop(upstream);
        forwarder.abort();
        let _ = forwarder.join().await;
        copied.map_err(|error| failure(error.to_string()))
    }
}

impl Forwarder for PortForwarder {
    fn path(&self) -> &str {
        &self.path
    }

    fn container(&self) -> &str {
        &self.tunnel.container
    }

    fn port_map(&self) -> String {
        self.tunnel.port_map()
    }

    fn address(&self) -> &str {
        &self.tunnel.address
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn age(&self) -> DateTime<Utc> {
        self.age
    }

    fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!(path = self.path, ports = self.port_map(), "stopping port-forward");
        }
        self.stop.cancel();
    }
}
