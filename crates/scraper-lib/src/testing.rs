//! In-process collaborators for tests

use crate::cluster::ClusterApi;
use crate::models::{ClusterPod, Endpoint, PodSummary, UnifiedRecord};
use crate::scrape::ExpositionSource;
use crate::sink::{RecordSink, SinkError};
use crate::tunnel::{TunnelError, TunnelProcess, TunnelTarget, TunnelTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How a fake tunnel to a given pod behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeBehaviour {
    Ready,
    NeverReady,
    ExitsEarly,
    SpawnFails,
}

/// What the fake transport observed
#[derive(Debug, Default)]
pub(crate) struct FakeLedger {
    pub started: Vec<(String, u16)>,
    pub terminated: HashMap<u16, usize>,
    pub killed: HashMap<u16, usize>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    behaviours: HashMap<String, FakeBehaviour>,
    ledger: Arc<Mutex<FakeLedger>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pods without an explicit behaviour become ready
    pub fn with(mut self, pod: &str, behaviour: FakeBehaviour) -> Self {
        self.behaviours.insert(pod.to_string(), behaviour);
        self
    }

    pub fn ledger(&self) -> Arc<Mutex<FakeLedger>> {
        Arc::clone(&self.ledger)
    }

    fn behaviour(&self, pod: &str) -> FakeBehaviour {
        self.behaviours
            .get(pod)
            .copied()
            .unwrap_or(FakeBehaviour::Ready)
    }
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn start(
        &self,
        target: &TunnelTarget,
        local_port: u16,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let behaviour = self.behaviour(&target.pod);
        if behaviour == FakeBehaviour::SpawnFails {
            return Err(TunnelError::Spawn {
                pod: target.pod.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "kubectl not found"),
            });
        }

        self.ledger
            .lock()
            .unwrap()
            .started
            .push((target.pod.clone(), local_port));

        Ok(Box::new(FakeProcess {
            port: local_port,
            behaviour,
            ledger: Arc::clone(&self.ledger),
        }))
    }

    async fn probe(&self, local_port: u16) -> bool {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .started
            .iter()
            .find(|(_, port)| *port == local_port)
            .map(|(pod, _)| self.behaviour(pod) == FakeBehaviour::Ready)
            .unwrap_or(false)
    }
}

struct FakeProcess {
    port: u16,
    behaviour: FakeBehaviour,
    ledger: Arc<Mutex<FakeLedger>>,
}

#[async_trait]
impl TunnelProcess for FakeProcess {
    fn has_exited(&mut self) -> bool {
        self.behaviour == FakeBehaviour::ExitsEarly
    }

    fn start_kill(&mut self) {
        *self.ledger.lock().unwrap().killed.entry(self.port).or_default() += 1;
    }

    async fn terminate(&mut self) {
        *self
            .ledger
            .lock()
            .unwrap()
            .terminated
            .entry(self.port)
            .or_default() += 1;
    }
}

/// Cluster API returning fixed pod lists, or failing
#[derive(Default)]
pub(crate) struct FakeCluster {
    pub pods: Vec<PodSummary>,
    pub all_pods: Vec<ClusterPod>,
    pub fail: bool,
}

impl FakeCluster {
    pub fn running(names: &[&str]) -> Self {
        Self {
            pods: names
                .iter()
                .map(|name| PodSummary {
                    name: name.to_string(),
                    phase: "Running".to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self, _namespace: &str, _selector: &str) -> anyhow::Result<Vec<PodSummary>> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        Ok(self.pods.clone())
    }

    async fn list_all_pods(&self) -> anyhow::Result<Vec<ClusterPod>> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        Ok(self.all_pods.clone())
    }
}

/// Exposition source serving one state body and a swappable usage body
pub(crate) struct FakeSource {
    state_url: String,
    state_body: Mutex<Option<String>>,
    usage_body: Mutex<Option<String>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new(state_url: &str, state_body: &str) -> Self {
        Self {
            state_url: state_url.to_string(),
            state_body: Mutex::new(Some(state_body.to_string())),
            usage_body: Mutex::new(None),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Body served by every usage endpoint; `None` makes them fail
    pub fn set_usage(&self, body: Option<&str>) {
        *self.usage_body.lock().unwrap() = body.map(str::to_string);
    }

    pub fn set_state(&self, body: Option<&str>) {
        *self.state_body.lock().unwrap() = body.map(str::to_string);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExpositionSource for FakeSource {
    async fn fetch(&self, endpoint: &Endpoint) -> anyhow::Result<String> {
        self.fetched.lock().unwrap().push(endpoint.url.clone());
        let body = if endpoint.url == self.state_url {
            self.state_body.lock().unwrap().clone()
        } else {
            self.usage_body.lock().unwrap().clone()
        };
        body.ok_or_else(|| anyhow::anyhow!("connection refused: {}", endpoint.url))
    }
}

/// Sink recording every batch it is given
#[derive(Default)]
pub(crate) struct CapturingSink {
    batches: Mutex<Vec<Vec<UnifiedRecord>>>,
    reject: AtomicBool,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<UnifiedRecord>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for CapturingSink {
    async fn deliver(&self, records: &[UnifiedRecord]) -> Result<usize, SinkError> {
        self.batches.lock().unwrap().push(records.to_vec());
        if self.reject.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected {
                status: 503,
                body: "ingest unavailable".to_string(),
            });
        }
        Ok(records.len())
    }
}
