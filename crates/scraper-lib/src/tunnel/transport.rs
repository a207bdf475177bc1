//! Tunnel transports
//!
//! A transport starts one forwarding process per target and reports
//! liveness through TCP connectability on the local port.

use super::{TunnelError, TunnelTarget};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::debug;

/// Upper bound on a single readiness connect attempt
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Upper bound on waiting for a killed process to be reaped
const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Starts forwarding processes and probes their local ports
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Start forwarding `local_port` to the target's remote port
    async fn start(
        &self,
        target: &TunnelTarget,
        local_port: u16,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError>;

    /// Whether the local end of a tunnel accepts connections
    async fn probe(&self, local_port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                PROBE_CONNECT_TIMEOUT,
                TcpStream::connect(("127.0.0.1", local_port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}

/// A running forwarding process
#[async_trait]
pub trait TunnelProcess: Send {
    /// Whether the process has already exited on its own
    fn has_exited(&mut self) -> bool;

    /// Request termination without waiting; safe to call from `Drop`
    fn start_kill(&mut self);

    /// Terminate the process and wait for it to be reaped
    async fn terminate(&mut self);
}

/// Forwards through `kubectl port-forward`
#[derive(Debug, Clone)]
pub struct KubectlTransport {
    binary: String,
    context: Option<String>,
}

impl Default for KubectlTransport {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl KubectlTransport {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            context: None,
        }
    }

    /// Use a specific kubeconfig context instead of the current one
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    fn command(&self, target: &TunnelTarget, local_port: u16) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("port-forward")
            .arg(format!("pod/{}", target.pod))
            .arg(format!("{}:{}", local_port, target.remote_port))
            .arg("-n")
            .arg(&target.namespace);
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl TunnelTransport for KubectlTransport {
    async fn start(
        &self,
        target: &TunnelTarget,
        local_port: u16,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let child = self
            .command(target, local_port)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                pod: target.pod.clone(),
                source,
            })?;

        debug!(
            pod = %target.pod,
            local_port = local_port,
            pid = ?child.id(),
            "Started port-forward process"
        );

        Ok(Box::new(KubectlProcess { child }))
    }
}

struct KubectlProcess {
    child: Child,
}

#[async_trait]
impl TunnelProcess for KubectlProcess {
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn start_kill(&mut self) {
        // Fails only when the process is already gone
        let _ = self.child.start_kill();
    }

    async fn terminate(&mut self) {
        self.start_kill();
        if tokio::time::timeout(TERMINATE_WAIT, self.child.wait())
            .await
            .is_err()
        {
            debug!(pid = ?self.child.id(), "Port-forward process not reaped in time");
        }
    }
}
