//! Tunnel management
//!
//! Opens one forwarding tunnel per usage exporter pod so its metrics can be
//! scraped from a local port. Every tunnel follows:
//!
//! ```text
//! starting ──probe ok──▶ ready ──close──▶ terminated
//!     └──timeout / exit──▶ failed ──close──▶ terminated
//! ```
//!
//! Tunnels opened for a cycle are owned by a [`TunnelSet`]; `close` tears
//! every one down exactly once, and dropping the set kills whatever is left.

mod transport;

#[cfg(test)]
mod tests;

pub use transport::{KubectlTransport, TunnelProcess, TunnelTransport};

use crate::cluster::{ClusterApi, RUNNING_PHASE};
use crate::models::Endpoint;
use crate::observability::StructuredLogger;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

/// Attempts at finding a port not yet handed out this cycle
const MAX_PORT_ATTEMPTS: usize = 16;

/// Errors raised while establishing a single tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to allocate a local port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("no unused local port after {0} attempts")]
    PortsExhausted(usize),

    #[error("failed to start tunnel to pod {pod}: {source}")]
    Spawn {
        pod: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle state of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Ready,
    Failed,
    Terminated,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Starting => "starting",
            TunnelState::Ready => "ready",
            TunnelState::Failed => "failed",
            TunnelState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A pod to tunnel to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub namespace: String,
    pub pod: String,
    pub remote_port: u16,
}

/// Tunnel discovery and readiness settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Namespace the exporter pods run in
    pub namespace: String,
    /// Label selector for exporter pods
    pub selector: String,
    /// Exporter metrics port inside the pod
    pub remote_port: u16,
    /// Pause between readiness probe rounds
    pub probe_interval: Duration,
    /// How long a tunnel may stay `starting` before it is marked failed
    pub ready_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            selector: "app=cadvisor".to_string(),
            remote_port: 8080,
            probe_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(15),
        }
    }
}

/// One tunnel, owned by its [`TunnelSet`] for its whole lifetime
pub struct TunnelHandle {
    target: TunnelTarget,
    local_port: u16,
    process: Option<Box<dyn TunnelProcess>>,
    state: TunnelState,
}

impl TunnelHandle {
    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Local metrics endpoint for this tunnel
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::local(self.target.pod.clone(), self.local_port)
    }

    fn transition(&mut self, to: TunnelState, logger: &StructuredLogger) {
        if self.state == to {
            return;
        }
        logger.log_tunnel_state(
            &self.target.pod,
            self.local_port,
            &self.state.to_string(),
            &to.to_string(),
        );
        self.state = to;
    }

    async fn terminate(&mut self, logger: &StructuredLogger) {
        if self.state == TunnelState::Terminated {
            return;
        }
        if let Some(mut process) = self.process.take() {
            process.terminate().await;
        }
        self.transition(TunnelState::Terminated, logger);
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("target", &self.target)
            .field("local_port", &self.local_port)
            .field("state", &self.state)
            .finish()
    }
}

/// Hands out local ports, never the same one twice
#[derive(Debug, Default)]
pub struct PortAllocator {
    issued: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the OS for a free loopback port
    pub fn allocate(&mut self) -> Result<u16, TunnelError> {
        for _ in 0..MAX_PORT_ATTEMPTS {
            let listener =
                TcpListener::bind(("127.0.0.1", 0)).map_err(TunnelError::PortAllocation)?;
            let port = listener
                .local_addr()
                .map_err(TunnelError::PortAllocation)?
                .port();
            drop(listener);

            if self.issued.insert(port) {
                return Ok(port);
            }
        }
        Err(TunnelError::PortsExhausted(MAX_PORT_ATTEMPTS))
    }
}

/// Discovers exporter pods and opens tunnels to them
pub struct TunnelManager {
    cluster: Arc<dyn ClusterApi>,
    transport: Arc<dyn TunnelTransport>,
    config: TunnelConfig,
    logger: StructuredLogger,
}

impl TunnelManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        transport: Arc<dyn TunnelTransport>,
        config: TunnelConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cluster,
            transport,
            config,
            logger,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// List running exporter pods
    pub async fn discover(&self) -> Result<Vec<TunnelTarget>> {
        let pods = self
            .cluster
            .list_pods(&self.config.namespace, &self.config.selector)
            .await
            .context("Failed to discover tunnel targets")?;

        let targets: Vec<TunnelTarget> = pods
            .into_iter()
            .filter(|pod| pod.phase == RUNNING_PHASE)
            .map(|pod| TunnelTarget {
                namespace: self.config.namespace.clone(),
                pod: pod.name,
                remote_port: self.config.remote_port,
            })
            .collect();

        info!(
            namespace = %self.config.namespace,
            selector = %self.config.selector,
            targets = targets.len(),
            "Discovered tunnel targets"
        );
        Ok(targets)
    }

    /// Discover targets, start one tunnel per target and wait for readiness.
    ///
    /// Only discovery failure is an error; per-tunnel failures leave that
    /// tunnel `failed` in the returned set.
    pub async fn open(&self) -> Result<TunnelSet> {
        let targets = self.discover().await?;
        let mut set = self.start_all(targets).await;
        self.await_ready(&mut set).await;
        Ok(set)
    }

    /// Start one process per target; nothing is probed yet
    pub async fn start_all(&self, targets: Vec<TunnelTarget>) -> TunnelSet {
        let mut ports = PortAllocator::new();
        let mut set = TunnelSet::new(self.logger.clone());

        for target in targets {
            let local_port = match ports.allocate() {
                Ok(port) => port,
                Err(e) => {
                    warn!(pod = %target.pod, error = %e, "Skipping tunnel target");
                    continue;
                }
            };

            let mut handle = TunnelHandle {
                target,
                local_port,
                process: None,
                state: TunnelState::Starting,
            };

            match self.transport.start(&handle.target, local_port).await {
                Ok(process) => handle.process = Some(process),
                Err(e) => {
                    warn!(pod = %handle.target.pod, error = %e, "Tunnel process did not start");
                    handle.transition(TunnelState::Failed, &self.logger);
                }
            }
            set.handles.push(handle);
        }

        set
    }

    /// Probe every starting tunnel until it is ready, its process exits,
    /// or the readiness timeout passes
    pub async fn await_ready(&self, set: &mut TunnelSet) {
        let deadline = Instant::now() + self.config.ready_timeout;

        loop {
            for handle in set.handles.iter_mut() {
                if handle.state != TunnelState::Starting {
                    continue;
                }
                let exited = handle.process.as_mut().map_or(true, |p| p.has_exited());
                if exited {
                    warn!(pod = %handle.target.pod, "Tunnel process exited before becoming ready");
                    handle.transition(TunnelState::Failed, &self.logger);
                }
            }

            let pending: Vec<(usize, u16)> = set
                .handles
                .iter()
                .enumerate()
                .filter(|(_, h)| h.state == TunnelState::Starting)
                .map(|(i, h)| (i, h.local_port))
                .collect();
            if pending.is_empty() {
                break;
            }

            let mut probes = JoinSet::new();
            for (index, port) in pending {
                let transport = Arc::clone(&self.transport);
                probes.spawn(async move { (index, transport.probe(port).await) });
            }
            while let Some(joined) = probes.join_next().await {
                if let Ok((index, true)) = joined {
                    set.handles[index].transition(TunnelState::Ready, &self.logger);
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }

        for handle in set.handles.iter_mut() {
            if handle.state == TunnelState::Starting {
                warn!(
                    pod = %handle.target.pod,
                    timeout_ms = self.config.ready_timeout.as_millis() as u64,
                    "Tunnel not ready before timeout"
                );
                handle.transition(TunnelState::Failed, &self.logger);
            }
        }

        info!(
            ready = set.ready_count(),
            failed = set.failed_count(),
            "Tunnels opened"
        );
    }
}

/// The tunnels of one scrape cycle
pub struct TunnelSet {
    handles: Vec<TunnelHandle>,
    logger: StructuredLogger,
}

impl TunnelSet {
    fn new(logger: StructuredLogger) -> Self {
        Self {
            handles: Vec::new(),
            logger,
        }
    }

    pub fn handles(&self) -> &[TunnelHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Endpoints of tunnels that reached `ready`
    pub fn ready_endpoints(&self) -> Vec<Endpoint> {
        self.handles
            .iter()
            .filter(|h| h.state == TunnelState::Ready)
            .map(TunnelHandle::endpoint)
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.count(TunnelState::Ready)
    }

    pub fn failed_count(&self) -> usize {
        self.count(TunnelState::Failed)
    }

    fn count(&self, state: TunnelState) -> usize {
        self.handles.iter().filter(|h| h.state == state).count()
    }

    /// Terminate every tunnel not yet terminated
    pub async fn close(&mut self) {
        for handle in self.handles.iter_mut() {
            handle.terminate(&self.logger).await;
        }
    }
}

impl Drop for TunnelSet {
    fn drop(&mut self) {
        let mut killed = 0;
        for handle in self.handles.iter_mut() {
            if handle.state == TunnelState::Terminated {
                continue;
            }
            if let Some(mut process) = handle.process.take() {
                process.start_kill();
                killed += 1;
            }
            handle.state = TunnelState::Terminated;
        }
        if killed > 0 {
            warn!(killed = killed, "Tunnel set dropped without close, killed remaining tunnels");
        }
    }
}
